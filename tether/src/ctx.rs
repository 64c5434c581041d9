//! Context: thread start-up, socket slots and orderly termination.
//!
//! Slot layout on the command bus:
//!
//! | slot | owner |
//! |---|---|
//! | 0 | termination mailbox (`Done` arrives here) |
//! | 1 | reaper |
//! | `2..2+N` | I/O threads |
//! | rest | application sockets |
//!
//! [`Context::terminate`] stops every live socket, waits until the reaper has
//! torn all of them down together with the I/O threads, joins the threads and
//! destroys every mailbox.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

use tether_core::command::{CommandKind, ObjectRef, ThreadId};
use tether_core::config::{Granularity, DEFAULT_MAX_SOCKETS, MAX_DEFAULT_IO_THREADS};
use tether_core::error::{Result, TetherError};
use tether_core::object::{unexpected, CommandBus, ObjectNode};
use tether_core::options::Options;

use crate::inproc::InprocRegistry;
use crate::io_thread::IoThread;
use crate::reaper::Reaper;
use crate::socket::Socket;

const TERM_TID: ThreadId = 0;
const REAPER_TID: ThreadId = 1;
const FIRST_IO_TID: ThreadId = 2;

/// Context configuration.
///
/// # Examples
///
/// ```
/// use tether::ctx::ContextConfig;
///
/// let config = ContextConfig::default().with_io_threads(2).with_max_sockets(16);
/// assert_eq!(config.io_threads, 2);
/// ```
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Number of I/O threads
    ///
    /// - Default: number of CPUs, at most 4, at least 1
    /// - 0: no I/O threads; sockets cannot launch children
    pub io_threads: usize,

    /// Maximum number of simultaneously open sockets
    pub max_sockets: usize,

    /// Queue chunk sizes for mailboxes and pipes
    pub granularity: Granularity,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            io_threads: num_cpus::get().clamp(1, MAX_DEFAULT_IO_THREADS),
            max_sockets: DEFAULT_MAX_SOCKETS,
            granularity: Granularity::default(),
        }
    }
}

impl ContextConfig {
    pub fn with_io_threads(mut self, io_threads: usize) -> Self {
        self.io_threads = io_threads;
        self
    }

    pub fn with_max_sockets(mut self, max_sockets: usize) -> Self {
        self.max_sockets = max_sockets;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }
}

struct Slots {
    free: Vec<ThreadId>,
    sockets: HashMap<ThreadId, ObjectRef>,
    terminating: bool,
}

/// State shared by the context, its sockets and the reaper.
pub(crate) struct Shared {
    pub(crate) bus: Arc<CommandBus>,
    pub(crate) endpoints: InprocRegistry,
    pub(crate) reaper: ObjectRef,
    term: ObjectNode,
    max_sockets: usize,
    slots: Mutex<Slots>,
}

impl Shared {
    /// A socket finished its teardown on the reaper; give its slot back.
    pub(crate) fn socket_reaped(&self, tid: ThreadId) {
        let mut slots = self.slots.lock();
        slots.sockets.remove(&tid);
        slots.free.push(tid);
        debug!("[CTX] socket slot {} released", tid);
        if slots.terminating && slots.sockets.is_empty() {
            self.term.send_stop(self.reaper);
        }
    }

    /// Address of the termination mailbox.
    pub(crate) fn term_ref(&self) -> ObjectRef {
        self.term.object_ref()
    }
}

/// Owner of the I/O threads, the reaper and all sockets.
///
/// Dropping a context terminates it, which blocks until every socket created
/// from it has been closed.
pub struct Context {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Context {
    /// Start the reaper and the I/O threads.
    pub fn new(config: ContextConfig) -> Result<Self> {
        let io_threads = config.io_threads as ThreadId;
        let io_range = FIRST_IO_TID..FIRST_IO_TID + io_threads;
        let slots = io_range.end as usize + config.max_sockets;
        let bus = Arc::new(CommandBus::new(slots, io_range.clone(), config.granularity));

        let term = ObjectNode::new(Arc::clone(&bus), TERM_TID);
        let reaper_node = ObjectNode::new(Arc::clone(&bus), REAPER_TID);
        let reaper_ref = reaper_node.object_ref();

        let shared = Arc::new(Shared {
            bus: Arc::clone(&bus),
            endpoints: InprocRegistry::new(),
            reaper: reaper_ref,
            term,
            max_sockets: config.max_sockets,
            slots: Mutex::new(Slots {
                free: (io_range.end..slots as ThreadId).rev().collect(),
                sockets: HashMap::new(),
                terminating: false,
            }),
        });

        let io: Vec<IoThread> = io_range
            .map(|tid| IoThread::new(Arc::clone(&bus), tid, reaper_ref))
            .collect();
        let io_refs = io.iter().map(IoThread::object_ref).collect();

        let mut threads = Vec::with_capacity(io.len() + 1);
        threads.push(Reaper::new(reaper_node, Arc::clone(&shared), io_refs).spawn()?);
        for thread in io {
            threads.push(thread.spawn()?);
        }

        info!(
            "[CTX] started: {} I/O threads, {} socket slots",
            io_threads, config.max_sockets
        );
        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Create a socket bound to a free slot.
    ///
    /// # Errors
    ///
    /// [`TetherError::Terminated`] once termination started,
    /// [`TetherError::TooManySockets`] when every slot is taken.
    pub fn socket(&self, options: Options) -> Result<Socket> {
        let mut slots = self.shared.slots.lock();
        if slots.terminating {
            return Err(TetherError::Terminated);
        }
        let tid = slots.free.pop().ok_or(TetherError::TooManySockets {
            max: self.shared.max_sockets,
        })?;
        let socket = Socket::new(Arc::clone(&self.shared), tid, options);
        slots.sockets.insert(tid, socket.object_ref());
        debug!("[CTX] socket {} created", socket.object_ref());
        Ok(socket)
    }

    /// Number of sockets that are open or still being torn down.
    pub fn socket_count(&self) -> usize {
        self.shared.slots.lock().sockets.len()
    }

    /// Names of the bound `inproc://` endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        self.shared.endpoints.names()
    }

    /// Terminate the context.
    ///
    /// Every open socket receives `Stop` and reports
    /// [`TetherError::Terminated`] from then on; the call returns once all of
    /// them have been closed and torn down. Calling it again is a no-op.
    pub fn terminate(&self) -> Result<()> {
        let mut threads = self.threads.lock();
        if threads.is_empty() {
            return Ok(());
        }

        {
            let mut slots = self.shared.slots.lock();
            slots.terminating = true;
            debug!("[CTX] terminating, {} sockets open", slots.sockets.len());
            for socket in slots.sockets.values() {
                self.shared.term.send_stop(*socket);
            }
            if slots.sockets.is_empty() {
                self.shared.term.send_stop(self.shared.reaper);
            }
        }

        let mailbox = self.shared.bus.mailbox(TERM_TID);
        loop {
            let Some(command) = mailbox.recv(None)? else {
                continue;
            };
            match command.kind {
                CommandKind::Done => break,
                other => unexpected(&self.shared.term, &other),
            }
        }

        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!("[CTX] a context thread panicked");
            }
        }
        for tid in 0..self.shared.bus.slots() as ThreadId {
            self.shared.bus.mailbox(tid).destroy();
        }
        info!("[CTX] terminated");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("[CTX] termination failed: {}", e);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("bus", &self.shared.bus)
            .field("sockets", &self.socket_count())
            .finish()
    }
}
