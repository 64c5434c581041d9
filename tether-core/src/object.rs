//! Objects, the command bus and command dispatch.
//!
//! Every object lives on exactly one thread and is only ever touched by that
//! thread. Objects talk to each other solely by sending [`Command`]s through
//! the [`CommandBus`], which owns one [`Mailbox`] per thread slot.
//!
//! The thread that owns an object hands every command addressed to it to
//! [`Participant::process`]. Handlers report through [`Disposition`] whether
//! the object has finished its life and must be dropped by its host.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use crate::command::{
    Command, CommandKind, Handoff, ObjectId, ObjectRef, OwnRef, PipeId, Reaping, ThreadId,
};
use crate::config::Granularity;
use crate::mailbox::Mailbox;
use crate::options::Linger;
use crate::pipe::Pipe;

/// Shared routing table: one mailbox per thread slot.
pub struct CommandBus {
    mailboxes: Vec<Arc<Mailbox>>,
    io_threads: Range<ThreadId>,
    loads: Vec<AtomicUsize>,
    next_id: AtomicU64,
    granularity: Granularity,
}

impl CommandBus {
    /// Create a bus with `slots` mailboxes; `io_threads` names the slots that
    /// run I/O threads and take part in load balancing.
    ///
    /// # Panics
    ///
    /// Panics if `io_threads` is not inside `0..slots`.
    pub fn new(slots: usize, io_threads: Range<ThreadId>, granularity: Granularity) -> Self {
        assert!(
            io_threads.end as usize <= slots,
            "I/O thread slots {io_threads:?} exceed {slots} slots"
        );
        let mailboxes = (0..slots)
            .map(|_| Arc::new(Mailbox::new(granularity.command)))
            .collect();
        let loads = io_threads.clone().map(|_| AtomicUsize::new(0)).collect();
        Self {
            mailboxes,
            io_threads,
            loads,
            next_id: AtomicU64::new(1),
            granularity,
        }
    }

    /// Number of thread slots.
    #[must_use]
    pub fn slots(&self) -> usize {
        self.mailboxes.len()
    }

    /// # Panics
    ///
    /// Panics on an unknown slot.
    #[must_use]
    pub fn mailbox(&self, tid: ThreadId) -> &Arc<Mailbox> {
        &self.mailboxes[tid as usize]
    }

    /// Route a command to the mailbox of its destination thread.
    pub fn send(&self, command: Command) {
        self.mailbox(command.destination.tid).send(command);
    }

    #[must_use]
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    #[must_use]
    pub fn io_threads(&self) -> Range<ThreadId> {
        self.io_threads.clone()
    }

    pub(crate) fn new_object_id(&self) -> ObjectId {
        ObjectId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn new_pipe_id(&self) -> PipeId {
        PipeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// The least loaded I/O thread, if there is any.
    #[must_use]
    pub fn choose_io_thread(&self) -> Option<ThreadId> {
        self.io_threads
            .clone()
            .zip(&self.loads)
            .min_by_key(|(_, load)| load.load(Ordering::Relaxed))
            .map(|(tid, _)| tid)
    }

    /// Record one more object living on I/O thread `tid`.
    pub fn load_increased(&self, tid: ThreadId) {
        if let Some(load) = self.load_of(tid) {
            load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one object fewer living on I/O thread `tid`.
    pub fn load_decreased(&self, tid: ThreadId) {
        if let Some(load) = self.load_of(tid) {
            load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn load(&self, tid: ThreadId) -> usize {
        self.load_of(tid).map_or(0, |load| load.load(Ordering::Relaxed))
    }

    fn load_of(&self, tid: ThreadId) -> Option<&AtomicUsize> {
        tid.checked_sub(self.io_threads.start)
            .and_then(|index| self.loads.get(index as usize))
    }
}

impl fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBus")
            .field("slots", &self.mailboxes.len())
            .field("io_threads", &self.io_threads)
            .finish_non_exhaustive()
    }
}

/// Identity of an object plus its access to the bus.
pub struct ObjectNode {
    bus: Arc<CommandBus>,
    tid: ThreadId,
    id: ObjectId,
}

impl ObjectNode {
    /// Create a new object living on thread `tid`.
    pub fn new(bus: Arc<CommandBus>, tid: ThreadId) -> Self {
        let id = bus.new_object_id();
        Self { bus, tid, id }
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<CommandBus> {
        &self.bus
    }

    #[must_use]
    pub const fn tid(&self) -> ThreadId {
        self.tid
    }

    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    #[must_use]
    pub const fn object_ref(&self) -> ObjectRef {
        ObjectRef {
            tid: self.tid,
            id: self.id,
        }
    }

    pub fn send(&self, destination: ObjectRef, kind: CommandKind) {
        let command = Command::new(destination, kind);
        trace!("[OBJECT] {} sends {}", self.object_ref(), command);
        self.bus.send(command);
    }

    pub fn send_stop(&self, destination: ObjectRef) {
        self.send(destination, CommandKind::Stop(destination.tid));
    }

    pub fn send_plug(&self, destination: &OwnRef, handoff: Option<Handoff>, inc_seqnum: bool) {
        if inc_seqnum {
            destination.inc_seqnum();
        }
        self.send(destination.object(), CommandKind::Plug(handoff));
    }

    pub fn send_own(&self, destination: &OwnRef, object: OwnRef) {
        destination.inc_seqnum();
        self.send(destination.object(), CommandKind::Own(object));
    }

    pub fn send_attach(&self, destination: &OwnRef, engine: Box<dyn Engine>, inc_seqnum: bool) {
        if inc_seqnum {
            destination.inc_seqnum();
        }
        self.send(destination.object(), CommandKind::Attach(engine));
    }

    pub fn send_bind(&self, destination: &OwnRef, pipe: Pipe, inc_seqnum: bool) {
        if inc_seqnum {
            destination.inc_seqnum();
        }
        self.send(destination.object(), CommandKind::Bind(pipe));
    }

    pub fn send_inproc_connected(&self, destination: &OwnRef) {
        destination.inc_seqnum();
        self.send(destination.object(), CommandKind::InprocConnected);
    }

    pub fn send_term_req(&self, destination: &OwnRef, object: OwnRef) {
        self.send(destination.object(), CommandKind::TermReq(object));
    }

    pub fn send_term(&self, destination: &OwnRef, linger: Linger) {
        self.send(destination.object(), CommandKind::Term(linger));
    }

    pub fn send_term_ack(&self, destination: &OwnRef) {
        self.send(destination.object(), CommandKind::TermAck(self.object_ref()));
    }

    pub fn send_reap(&self, reaper: ObjectRef, reaping: Reaping) {
        self.send(reaper, CommandKind::Reap(reaping));
    }

    pub fn send_reaped(&self, destination: ObjectRef) {
        self.send(destination, CommandKind::Reaped(self.object_ref()));
    }

    pub fn send_done(&self, destination: ObjectRef) {
        self.send(destination, CommandKind::Done);
    }
}

impl fmt::Debug for ObjectNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectNode({})", self.object_ref())
    }
}

/// Outcome of processing one command.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// The object stays alive.
    #[default]
    Continue,
    /// The object has finished terminating; its host drops it.
    Destroy,
}

impl Disposition {
    #[must_use]
    pub const fn is_destroy(self) -> bool {
        matches!(self, Self::Destroy)
    }

    /// `Destroy` if either side is.
    pub const fn or(self, other: Self) -> Self {
        match (self, other) {
            (Self::Continue, Self::Continue) => Self::Continue,
            _ => Self::Destroy,
        }
    }
}

/// An object that can receive commands.
pub trait Participant: Send {
    fn object(&self) -> &ObjectNode;

    /// Handle one command addressed to this object.
    fn process(&mut self, command: CommandKind) -> Disposition;
}

/// A socket that can be handed over to the reaper once closed.
pub trait Reapable: Participant {
    /// Mailbox the reaper polls on the socket's behalf.
    fn mailbox(&self) -> Arc<Mailbox>;

    /// Called on the reaper thread right after adoption.
    fn start_reaping(&mut self) -> Disposition;
}

/// Seam for transport engines.
///
/// The runtime in this workspace only has inproc pipes, which need no
/// engine; a transport (a TCP or IPC connection driver, say) implements this
/// trait and is handed to the session that owns it with
/// [`ObjectNode::send_attach`]. The session plugs the engine on its own
/// thread and terminates it when the session goes away.
pub trait Engine: Send + fmt::Debug {
    /// Start driving I/O on behalf of `session`.
    fn plug(&mut self, session: ObjectRef);

    /// Stop and release the engine.
    fn terminate(self: Box<Self>);
}

/// Fail-fast for a command the receiving object does not handle.
///
/// # Panics
///
/// Always.
#[track_caller]
pub fn unexpected(object: &ObjectNode, command: &CommandKind) -> ! {
    panic!(
        "object {} received unexpected command `{}`",
        object.object_ref(),
        command.name()
    )
}
