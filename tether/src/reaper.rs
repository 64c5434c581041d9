//! Reaper thread: final teardown of closed sockets and stopped I/O threads.
//!
//! A closed socket is handed over in a `Reap` command. The reaper starts its
//! termination and from then on drains the socket's own mailbox on the
//! socket's behalf until the socket reports [`Disposition::Destroy`]. There is
//! no poller: while sockets are adopted, the reaper wakes up every
//! [`REAPER_POLL_INTERVAL`] to look at their mailboxes.
//!
//! Once the context asks it to stop and no socket is left, the reaper stops
//! the I/O threads, confirms each of them with `Reaped`, and finally sends
//! `Done` to the termination mailbox.

use hashbrown::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

use tether_core::command::{CommandKind, ObjectId, ObjectRef, Reaping};
use tether_core::config::REAPER_POLL_INTERVAL;
use tether_core::error::{Result, TetherError};
use tether_core::object::{unexpected, Disposition, ObjectNode, Reapable};

use crate::ctx::Shared;

pub(crate) struct Reaper {
    object: ObjectNode,
    shared: Arc<Shared>,
    sockets: HashMap<ObjectId, Box<dyn Reapable>>,
    io_threads: Vec<ObjectRef>,
    pending_threads: usize,
    terminating: bool,
}

impl Reaper {
    pub(crate) fn new(object: ObjectNode, shared: Arc<Shared>, io_threads: Vec<ObjectRef>) -> Self {
        Self {
            object,
            shared,
            sockets: HashMap::new(),
            io_threads,
            pending_threads: 0,
            terminating: false,
        }
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("tether-reaper".into())
            .spawn(move || self.run())
            .map_err(TetherError::Io)
    }

    fn run(mut self) {
        let mailbox = Arc::clone(self.object.bus().mailbox(self.object.tid()));
        debug!("[REAPER] started");
        loop {
            let timeout = if self.sockets.is_empty() {
                None
            } else {
                Some(REAPER_POLL_INTERVAL)
            };
            match mailbox.recv(timeout) {
                Ok(Some(command)) => {
                    if command.destination != self.object.object_ref() {
                        warn!("[REAPER] dropping misrouted {}", command);
                    } else if self.process(command.kind) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("[REAPER] mailbox failed: {}", e);
                    break;
                }
            }
            self.poll_sockets();
        }
        debug!("[REAPER] stopped");
    }

    /// Returns `true` once the reaper is done.
    fn process(&mut self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Reap(Reaping::Socket(socket)) => {
                self.adopt(socket);
                false
            }
            CommandKind::Reap(Reaping::Thread(thread)) => self.process_thread_stopped(thread),
            CommandKind::Stop(_) => {
                if self.terminating {
                    trace!("[REAPER] already stopping");
                    return false;
                }
                debug!("[REAPER] stop requested, {} sockets left", self.sockets.len());
                self.terminating = true;
                self.sockets.is_empty() && self.stop_io_threads()
            }
            other => unexpected(&self.object, &other),
        }
    }

    fn adopt(&mut self, mut socket: Box<dyn Reapable>) {
        let socket_ref = socket.object().object_ref();
        trace!("[REAPER] adopting {}", socket_ref);
        if socket.start_reaping().is_destroy() {
            self.reaped(socket_ref);
            return;
        }
        self.sockets.insert(socket_ref.id, socket);
    }

    /// Drain every adopted socket's mailbox once.
    fn poll_sockets(&mut self) {
        let mut destroyed = Vec::new();
        for (id, socket) in &mut self.sockets {
            let mailbox = socket.mailbox();
            loop {
                match mailbox.recv(Some(Duration::ZERO)) {
                    Ok(Some(command)) => {
                        if socket.process(command.kind) == Disposition::Destroy {
                            destroyed.push((*id, socket.object().object_ref()));
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[REAPER] socket mailbox failed: {}", e);
                        break;
                    }
                }
            }
        }
        for (id, socket_ref) in destroyed {
            self.sockets.remove(&id);
            self.reaped(socket_ref);
        }
    }

    fn reaped(&mut self, socket: ObjectRef) {
        debug!("[REAPER] {} reaped", socket);
        self.shared.socket_reaped(socket.tid);
    }

    /// Returns `true` when there was nothing left to stop.
    fn stop_io_threads(&mut self) -> bool {
        if self.io_threads.is_empty() {
            self.finish();
            return true;
        }
        self.pending_threads = self.io_threads.len();
        for thread in &self.io_threads {
            self.object.send_stop(*thread);
        }
        false
    }

    fn process_thread_stopped(&mut self, thread: ObjectRef) -> bool {
        self.object.send_reaped(thread);
        self.pending_threads = self.pending_threads.saturating_sub(1);
        trace!(
            "[REAPER] {} reaped, {} threads pending",
            thread,
            self.pending_threads
        );
        if self.pending_threads == 0 {
            self.finish();
            return true;
        }
        false
    }

    fn finish(&self) {
        debug!("[REAPER] everything reaped");
        self.object.send_done(self.shared.term_ref());
    }
}
