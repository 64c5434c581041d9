//! Commands exchanged between objects living on different threads.
//!
//! A [`Command`] is addressed to an object ([`ObjectRef`] = thread slot +
//! object id) and carries one [`CommandKind`]. Payloads are moved into the
//! command by the sender and consumed exactly once by the receiver.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::msg::Msg;
use crate::object::{Engine, Participant, Reapable};
use crate::options::Linger;
use crate::pipe::{Pipe, PipeState};
use crate::queue::{QueueReader, QueueWriter};

/// Index of a thread slot (and its mailbox) on the command bus.
pub type ThreadId = u32;

/// Process-unique identifier of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-unique identifier of one pipe half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub(crate) u64);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Address of an object: the thread it lives on and its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub tid: ThreadId,
    pub id: ObjectId,
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.tid)
    }
}

/// Address of a pipe half: the object hosting it plus the pipe id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeRef {
    pub host: ObjectRef,
    pub pipe: PipeId,
}

/// Address of an ownership node together with its send-side sequence
/// counter.
///
/// Anyone holding an `OwnRef` may bump the counter before sending a command
/// that the node must process before it is allowed to terminate.
#[derive(Clone)]
pub struct OwnRef {
    object: ObjectRef,
    send_seqnum: Arc<AtomicU64>,
}

impl OwnRef {
    pub(crate) fn new(object: ObjectRef, send_seqnum: Arc<AtomicU64>) -> Self {
        Self {
            object,
            send_seqnum,
        }
    }

    #[must_use]
    pub const fn object(&self) -> ObjectRef {
        self.object
    }

    /// Announce one more in-flight command to this node.
    ///
    /// Callable from any thread.
    pub fn inc_seqnum(&self) {
        self.send_seqnum.fetch_add(1, Ordering::AcqRel);
    }
}

impl PartialEq for OwnRef {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl Eq for OwnRef {}

impl std::hash::Hash for OwnRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.object.hash(state);
    }
}

impl fmt::Debug for OwnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnRef({})", self.object)
    }
}

/// A participant moving to the thread named by its address.
pub struct Handoff(Box<dyn Participant>);

impl Handoff {
    pub fn new(participant: impl Participant + 'static) -> Self {
        Self(Box::new(participant))
    }

    #[must_use]
    pub fn from_box(participant: Box<dyn Participant>) -> Self {
        Self(participant)
    }

    #[must_use]
    pub fn object(&self) -> ObjectRef {
        self.0.object().object_ref()
    }

    #[must_use]
    pub fn into_inner(self) -> Box<dyn Participant> {
        self.0
    }
}

impl fmt::Debug for Handoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handoff({})", self.object())
    }
}

/// Queues exchanged by a pipe hiccup.
///
/// `queue` is the writer end of the fresh queue the peer must write into
/// from now on; `stale` is the reader end of the abandoned queue, handed
/// over so the peer can un-count what it had written into it.
pub struct Hiccup {
    pub queue: QueueWriter<Msg>,
    pub stale: Option<QueueReader<Msg>>,
}

impl fmt::Debug for Hiccup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hiccup")
            .field("stale", &self.stale.is_some())
            .finish_non_exhaustive()
    }
}

/// What the reaper is asked to reap.
pub enum Reaping {
    /// A closed socket handing itself over for final teardown.
    Socket(Box<dyn Reapable>),
    /// An I/O thread that has stopped and waits for confirmation.
    Thread(ObjectRef),
}

impl fmt::Debug for Reaping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(socket) => write!(f, "Socket({})", socket.object().object_ref()),
            Self::Thread(thread) => write!(f, "Thread({thread})"),
        }
    }
}

/// The closed set of commands.
#[derive(Debug)]
pub enum CommandKind {
    /// Stop the thread (or socket) living in this slot.
    Stop(ThreadId),
    /// Start the object; carries the object itself when it moves threads.
    Plug(Option<Handoff>),
    /// Register a freshly launched child with its owner.
    Own(OwnRef),
    /// Attach a transport engine to a session.
    Attach(Box<dyn Engine>),
    /// Hand one pipe half to the object that will use it.
    Bind(Pipe),
    /// The peer flushed messages into a pipe whose reader was asleep.
    ActivateRead(PipeId),
    /// The peer has read this many messages; the writer may resume.
    ActivateWrite(PipeId, u64),
    /// The peer replaced its inbound queue.
    Hiccup(PipeId, Hiccup),
    /// The peer asks this pipe half to terminate.
    PipeTerm(PipeId),
    /// The peer acknowledges termination, reporting its own state.
    PipeTermAck(PipeId, PipeState),
    /// A child asks its owner to be terminated.
    TermReq(OwnRef),
    /// Terminate, lingering as specified.
    Term(Linger),
    /// A child finished terminating.
    TermAck(ObjectRef),
    /// Hand something over to the reaper.
    Reap(Reaping),
    /// Final teardown of an object was confirmed.
    Reaped(ObjectRef),
    /// An inproc connection was completed for this socket.
    InprocConnected,
    /// Sent to the termination slot once everything is reaped.
    Done,
}

impl CommandKind {
    /// Commands whose sender bumped the destination's `send_seqnum`; the
    /// destination must catch up after processing them.
    #[must_use]
    pub const fn requires_seqnum(&self) -> bool {
        matches!(
            self,
            Self::Plug(_) | Self::Own(_) | Self::Attach(_) | Self::Bind(_) | Self::InprocConnected
        )
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Stop(_) => "stop",
            Self::Plug(_) => "plug",
            Self::Own(_) => "own",
            Self::Attach(_) => "attach",
            Self::Bind(_) => "bind",
            Self::ActivateRead(_) => "activate_read",
            Self::ActivateWrite(..) => "activate_write",
            Self::Hiccup(..) => "hiccup",
            Self::PipeTerm(_) => "pipe_term",
            Self::PipeTermAck(..) => "pipe_term_ack",
            Self::TermReq(_) => "term_req",
            Self::Term(_) => "term",
            Self::TermAck(_) => "term_ack",
            Self::Reap(_) => "reap",
            Self::Reaped(_) => "reaped",
            Self::InprocConnected => "inproc_connected",
            Self::Done => "done",
        }
    }
}

/// A command in flight.
#[derive(Debug)]
pub struct Command {
    pub destination: ObjectRef,
    pub kind: CommandKind,
}

impl Command {
    #[must_use]
    pub const fn new(destination: ObjectRef, kind: CommandKind) -> Self {
        Self { destination, kind }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.kind.name(), self.destination)
    }
}
