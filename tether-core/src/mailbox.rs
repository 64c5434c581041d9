//! Per-thread command mailbox.
//!
//! Many writers, one reader. Writers serialize on a lock around the
//! exchange queue's writer end and signal the reader only when the flush
//! finds it asleep, so a burst of commands costs one wake-up.
//!
//! The reader alternates between two states:
//! - **active**: commands are taken straight from the queue, no signaler
//!   traffic;
//! - **passive**: the queue was found empty, the reader blocks on the
//!   signaler until the next flush wakes it.

use parking_lot::Mutex;
use std::time::Duration;
use tracing::{trace, warn};

use crate::command::{Command, CommandKind};
use crate::error::{Result, TetherError};
use crate::queue::{exchange_queue, ExchangeReader, ExchangeWriter};
use crate::signaler::{SignalError, Signaler};

struct Inbox {
    queue: ExchangeReader<Command>,
    active: bool,
}

/// Command queue plus wake-up signal of one thread slot.
pub struct Mailbox {
    outbox: Mutex<ExchangeWriter<Command>>,
    inbox: Mutex<Inbox>,
    signaler: Signaler,
}

impl Mailbox {
    pub fn new(granularity: usize) -> Self {
        let (writer, mut reader) = exchange_queue(granularity);
        // Put the reader to sleep so the first command raises a signal.
        let pending = reader.check_read();
        debug_assert!(!pending);
        Self {
            outbox: Mutex::new(writer),
            inbox: Mutex::new(Inbox {
                queue: reader,
                active: false,
            }),
            signaler: Signaler::new(),
        }
    }

    /// Enqueue a command. Callable from any thread.
    pub fn send(&self, command: Command) {
        trace!("[MAILBOX] send {}", command);
        let mut outbox = self.outbox.lock();
        outbox.write(command, false);
        if !outbox.flush() {
            self.signaler.send();
        }
    }

    /// Take the next command.
    ///
    /// Returns `Ok(None)` when `timeout` elapsed without a command
    /// (`Some(Duration::ZERO)` polls) and [`TetherError::MailboxClosed`] once
    /// the mailbox has been destroyed.
    ///
    /// # Panics
    ///
    /// Panics if a wake-up signal arrives but the queue is empty: every
    /// signal corresponds to a flushed command.
    pub fn recv(&self, timeout: Option<Duration>) -> Result<Option<Command>> {
        let mut inbox = self.inbox.lock();

        if inbox.active {
            if let Some(command) = inbox.queue.read() {
                return Ok(Some(command));
            }
            // Queue drained; from now on the writer will signal us.
            inbox.active = false;
        }

        match self.signaler.wait(timeout) {
            Ok(()) => {}
            Err(SignalError::Timeout) => return Ok(None),
            Err(SignalError::Closed) => return Err(TetherError::MailboxClosed),
        }
        self.signaler.recv();
        inbox.active = true;

        let command = inbox.queue.read();
        assert!(command.is_some(), "mailbox woken without a pending command");
        Ok(command)
    }

    /// Close the mailbox and discard what is left in it.
    ///
    /// Waits for senders currently inside [`Mailbox::send`] to leave, then
    /// releases any blocked reader.
    pub fn destroy(&self) {
        let _outbox = self.outbox.lock();
        // A blocked reader holds the inbox lock until the signaler lets go.
        self.signaler.close();
        let mut inbox = self.inbox.lock();
        while let Some(command) = inbox.queue.read() {
            if !matches!(command.kind, CommandKind::Done | CommandKind::Stop(_)) {
                warn!("[MAILBOX] Dropping {} on destroy", command);
            }
        }
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("closed", &self.signaler.is_closed())
            .finish_non_exhaustive()
    }
}
