//! Pipes: bidirectional message channels between two objects.
//!
//! A pipe pair is two [`Pipe`] halves sharing two exchange queues, one per
//! direction. Each half lives on the thread of its host object and is
//! addressed as `(host, PipeId)`; commands for a half are delivered to the
//! host, which routes them to [`Pipe::process`].
//!
//! ## Flow control
//!
//! The writer counts complete messages written, the reader counts messages
//! read and reports its count back with `ActivateWrite` every `lwm` reads.
//! The writer stops when `msgs_written - peers_msgs_read` reaches `hwm`.
//!
//! ## Termination
//!
//! Either side (or both at once) may start terminating. The handshake writes
//! a delimiter behind the pending messages, exchanges `PipeTerm` and
//! `PipeTermAck`, and ends with both halves destroyed and exactly one
//! `PipeTermAck` sent in each direction:
//!
//! ```text
//!  Active ──terminate──▶ TermReqSent1 ──pipe_term──▶ TermReqSent2
//!    │                        │                          │
//!    │ pipe_term              │ pipe_term_ack            │ pipe_term_ack
//!    ▼                        ▼                          ▼
//!  WaitingForDelimiter ──delimiter──▶ TermAckSent ──pipe_term_ack──▶ (gone)
//! ```

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::command::{Command, CommandKind, Hiccup, ObjectRef, PipeId, PipeRef};
use crate::msg::Msg;
use crate::object::{CommandBus, Disposition};
use crate::queue::{pipe_queue, QueueReader, QueueWriter};

/// Termination state of one pipe half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeState {
    /// Normal operation.
    Active,
    /// The delimiter was read before the peer's `PipeTerm` arrived.
    DelimiterReceived,
    /// The peer asked to terminate; draining up to the delimiter.
    WaitingForDelimiter,
    /// This side acknowledged the peer's termination request.
    TermAckSent,
    /// This side asked to terminate.
    TermReqSent1,
    /// Both sides asked to terminate; this side acknowledged the peer.
    TermReqSent2,
}

impl PipeState {
    const fn is_readable(self) -> bool {
        matches!(self, Self::Active | Self::WaitingForDelimiter)
    }

    const fn is_terminal(self) -> bool {
        matches!(self, Self::TermAckSent | Self::TermReqSent1 | Self::TermReqSent2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Terminate,
    Delimiter,
    PipeTerm,
    PipeTermAck(PipeState),
}

/// Callbacks a pipe makes into its host while processing commands.
pub trait PipeEvents {
    /// Messages became available on a pipe that was found empty.
    fn read_activated(&mut self, pipe: PipeId);
    /// The peer caught up; a pipe that hit its high watermark is writable.
    fn write_activated(&mut self, pipe: PipeId);
    /// The peer replaced the queue this pipe writes into.
    fn hiccuped(&mut self, pipe: PipeId);
    /// The termination handshake completed; the pipe is about to be dropped.
    fn pipe_terminated(&mut self, pipe: PipeId);
}

/// Low watermark derived from the high watermark of the inbound direction.
const fn compute_lwm(hwm: u32) -> u32 {
    // Half-way point, rounded up; 0 stays unbounded.
    hwm.div_ceil(2)
}

/// One half of a pipe pair.
pub struct Pipe {
    bus: Arc<CommandBus>,
    id: PipeId,
    host: ObjectRef,
    peer: PipeRef,

    inbound: Option<QueueReader<Msg>>,
    outbound: Option<QueueWriter<Msg>>,
    in_active: bool,
    out_active: bool,

    hwm: u32,
    lwm: u32,
    msgs_read: u64,
    msgs_written: u64,
    peers_msgs_read: u64,

    state: PipeState,
    delay: bool,
    conflate: bool,

    identity: Option<Bytes>,
    credential: Option<Bytes>,
}

/// Create two connected pipe halves.
///
/// `parents[i]` hosts half `i`. `hwms[0]` bounds the messages in flight from
/// half 0 to half 1, `hwms[1]` the other direction; `0` means unbounded.
/// `conflates[i]` makes the queue *read by* half `i` keep only the latest
/// message.
pub fn pipe_pair(
    bus: &Arc<CommandBus>,
    parents: [ObjectRef; 2],
    hwms: [u32; 2],
    conflates: [bool; 2],
) -> [Pipe; 2] {
    let granularity = bus.granularity().message;
    let (to_first, first_in) = pipe_queue(conflates[0], granularity);
    let (to_second, second_in) = pipe_queue(conflates[1], granularity);

    let ids = [bus.new_pipe_id(), bus.new_pipe_id()];
    let first = Pipe::new(
        bus,
        ids[0],
        parents[0],
        PipeRef {
            host: parents[1],
            pipe: ids[1],
        },
        first_in,
        to_second,
        hwms[1],
        hwms[0],
        conflates[0],
    );
    let second = Pipe::new(
        bus,
        ids[1],
        parents[1],
        PipeRef {
            host: parents[0],
            pipe: ids[0],
        },
        second_in,
        to_first,
        hwms[0],
        hwms[1],
        conflates[1],
    );
    trace!("[PIPE] created {} <-> {}", ids[0], ids[1]);
    [first, second]
}

impl Pipe {
    #[allow(clippy::too_many_arguments)]
    fn new(
        bus: &Arc<CommandBus>,
        id: PipeId,
        host: ObjectRef,
        peer: PipeRef,
        inbound: QueueReader<Msg>,
        outbound: QueueWriter<Msg>,
        in_hwm: u32,
        out_hwm: u32,
        conflate: bool,
    ) -> Self {
        Self {
            bus: Arc::clone(bus),
            id,
            host,
            peer,
            inbound: Some(inbound),
            outbound: Some(outbound),
            in_active: true,
            out_active: true,
            hwm: out_hwm,
            lwm: compute_lwm(in_hwm),
            msgs_read: 0,
            msgs_written: 0,
            peers_msgs_read: 0,
            state: PipeState::Active,
            delay: true,
            conflate,
            identity: None,
            credential: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> PipeId {
        self.id
    }

    /// Object hosting this half.
    #[must_use]
    pub const fn host(&self) -> ObjectRef {
        self.host
    }

    /// Address of the other half.
    #[must_use]
    pub const fn peer(&self) -> PipeRef {
        self.peer
    }

    #[must_use]
    pub const fn state(&self) -> PipeState {
        self.state
    }

    #[must_use]
    pub const fn hwm(&self) -> u32 {
        self.hwm
    }

    #[must_use]
    pub const fn lwm(&self) -> u32 {
        self.lwm
    }

    pub fn set_identity(&mut self, identity: Bytes) {
        self.identity = Some(identity);
    }

    #[must_use]
    pub fn identity(&self) -> Option<&Bytes> {
        self.identity.as_ref()
    }

    /// Last credential frame seen on the inbound queue.
    #[must_use]
    pub fn credential(&self) -> Option<&Bytes> {
        self.credential.as_ref()
    }

    /// Check whether a message can be read, consuming a delimiter if that is
    /// what comes next.
    pub fn check_read(&mut self) -> bool {
        if !self.in_active || !self.state.is_readable() {
            return false;
        }
        let Some(inbound) = self.inbound.as_mut() else {
            return false;
        };
        if !inbound.check_read() {
            self.in_active = false;
            return false;
        }
        if inbound.probe(Msg::is_delimiter) == Some(true) {
            let delimiter = inbound.read();
            debug_assert!(delimiter.is_some());
            self.process_delimiter();
            return false;
        }
        true
    }

    /// Read one message frame.
    ///
    /// Credential frames are absorbed; a delimiter advances the termination
    /// handshake and yields `None`.
    pub fn read(&mut self) -> Option<Msg> {
        if !self.in_active || !self.state.is_readable() {
            return None;
        }
        loop {
            let Some(msg) = self.inbound.as_mut().and_then(QueueReader::read) else {
                self.in_active = false;
                return None;
            };

            if msg.is_credential() {
                self.credential = Some(msg.into_data());
                continue;
            }

            if msg.is_delimiter() {
                self.process_delimiter();
                return None;
            }

            if !msg.has_more() && !msg.is_identity() {
                self.msgs_read += 1;
                if self.lwm > 0 && self.msgs_read % u64::from(self.lwm) == 0 {
                    self.send_to_peer(CommandKind::ActivateWrite(self.peer.pipe, self.msgs_read));
                }
            }
            return Some(msg);
        }
    }

    /// Check whether a message can be written without exceeding the high
    /// watermark. A full pipe stays inactive until the peer catches up.
    pub fn check_write(&mut self) -> bool {
        if !self.out_active || self.state != PipeState::Active {
            return false;
        }
        if !self.check_hwm() {
            self.out_active = false;
            return false;
        }
        true
    }

    /// `true` while the number of unacknowledged messages is below `hwm`.
    #[must_use]
    pub fn check_hwm(&self) -> bool {
        self.hwm == 0
            || self.msgs_written.saturating_sub(self.peers_msgs_read) < u64::from(self.hwm)
    }

    /// Write one message frame.
    ///
    /// Hands the message back when the pipe is not writable. Frames with
    /// `MORE` set, and identity frames, do not count against the watermark.
    pub fn write(&mut self, msg: Msg) -> Result<(), Msg> {
        if !self.check_write() {
            return Err(msg);
        }
        let Some(outbound) = self.outbound.as_mut() else {
            return Err(msg);
        };
        let more = msg.has_more();
        let identity = msg.is_identity();
        outbound.write(msg, more);
        if !more && !identity {
            self.msgs_written += 1;
        }
        Ok(())
    }

    /// Drop the unflushed frames of an incomplete multi-part message.
    ///
    /// # Panics
    ///
    /// Panics if a rolled back frame is not a `MORE` frame.
    pub fn rollback(&mut self) {
        if let Some(outbound) = self.outbound.as_mut() {
            while let Some(msg) = outbound.unwrite() {
                assert!(msg.has_more(), "rolled back a complete message");
            }
        }
    }

    /// Publish written messages, waking the peer if it was asleep.
    pub fn flush(&mut self) {
        if self.state == PipeState::TermAckSent {
            return;
        }
        let needs_wakeup = self
            .outbound
            .as_mut()
            .is_some_and(|outbound| !outbound.flush());
        if needs_wakeup {
            self.send_to_peer(CommandKind::ActivateRead(self.peer.pipe));
        }
    }

    /// Update the watermarks (inbound hwm drives the local lwm).
    pub fn set_hwms(&mut self, in_hwm: u32, out_hwm: u32) {
        self.lwm = compute_lwm(in_hwm);
        self.hwm = out_hwm;
    }

    /// Acknowledge a peer-initiated termination without draining.
    pub fn set_no_delay(&mut self) {
        self.delay = false;
    }

    /// Start (or join) the termination handshake.
    ///
    /// With `delay` pending inbound messages stay readable until the
    /// delimiter; without it they are dropped.
    pub fn terminate(&mut self, delay: bool) {
        self.delay = delay;
        self.run_event(Event::Terminate);
    }

    /// Replace the inbound queue, handing the old one to the peer.
    ///
    /// Only meaningful while active.
    pub fn hiccup(&mut self) {
        if self.state != PipeState::Active {
            return;
        }
        let (queue, reader) = pipe_queue(self.conflate, self.bus.granularity().message);
        let stale = self.inbound.replace(reader);
        self.in_active = true;
        debug!("[PIPE] {} hiccup", self.id);
        self.send_to_peer(CommandKind::Hiccup(self.peer.pipe, Hiccup { queue, stale }));
    }

    /// Handle a command addressed to this pipe.
    ///
    /// Returns [`Disposition::Destroy`] once the termination handshake is
    /// complete; the host then drops the pipe.
    ///
    /// # Panics
    ///
    /// Panics on a command that is not a pipe command, or one addressed to a
    /// different pipe.
    pub fn process(&mut self, command: CommandKind, sink: &mut dyn PipeEvents) -> Disposition {
        match command {
            CommandKind::ActivateRead(id) => {
                self.assert_addressed(id);
                self.process_activate_read(sink);
                Disposition::Continue
            }
            CommandKind::ActivateWrite(id, msgs_read) => {
                self.assert_addressed(id);
                self.process_activate_write(msgs_read, sink);
                Disposition::Continue
            }
            CommandKind::Hiccup(id, hiccup) => {
                self.assert_addressed(id);
                self.process_hiccup(hiccup, sink);
                Disposition::Continue
            }
            CommandKind::PipeTerm(id) => {
                self.assert_addressed(id);
                self.process_pipe_term();
                Disposition::Continue
            }
            CommandKind::PipeTermAck(id, peer_state) => {
                self.assert_addressed(id);
                self.process_pipe_term_ack(peer_state, sink);
                Disposition::Destroy
            }
            CommandKind::Stop(_)
            | CommandKind::Plug(_)
            | CommandKind::Own(_)
            | CommandKind::Attach(_)
            | CommandKind::Bind(_)
            | CommandKind::TermReq(_)
            | CommandKind::Term(_)
            | CommandKind::TermAck(_)
            | CommandKind::Reap(_)
            | CommandKind::Reaped(_)
            | CommandKind::InprocConnected
            | CommandKind::Done => {
                panic!("{} received non-pipe command `{}`", self.id, command.name())
            }
        }
    }

    fn assert_addressed(&self, id: PipeId) {
        assert_eq!(id, self.id, "command for {id} delivered to {}", self.id);
    }

    fn process_activate_read(&mut self, sink: &mut dyn PipeEvents) {
        if !self.in_active && self.state.is_readable() {
            self.in_active = true;
            sink.read_activated(self.id);
        }
    }

    fn process_activate_write(&mut self, msgs_read: u64, sink: &mut dyn PipeEvents) {
        self.peers_msgs_read = msgs_read;
        if !self.out_active && self.state == PipeState::Active {
            self.out_active = true;
            sink.write_activated(self.id);
        }
    }

    fn process_hiccup(&mut self, hiccup: Hiccup, sink: &mut dyn PipeEvents) {
        let Some(mut old) = self.outbound.take() else {
            trace!("[PIPE] {} dropping hiccup after outbound closed", self.id);
            return;
        };
        // Whatever the peer never read no longer counts against the hwm.
        let _ = old.flush();
        if let Some(mut stale) = hiccup.stale {
            while let Some(msg) = stale.read() {
                if !msg.has_more() && !msg.is_identity() && !msg.is_delimiter() {
                    self.msgs_written = self.msgs_written.saturating_sub(1);
                }
            }
        }
        drop(old);

        self.outbound = Some(hiccup.queue);
        self.out_active = true;
        if self.state == PipeState::Active {
            sink.hiccuped(self.id);
        }
    }

    fn process_pipe_term(&mut self) {
        self.run_event(Event::PipeTerm);
    }

    fn process_pipe_term_ack(&mut self, peer_state: PipeState, sink: &mut dyn PipeEvents) {
        assert!(
            self.state.is_terminal(),
            "{} got pipe_term_ack in state {:?}",
            self.id,
            self.state
        );
        assert!(
            peer_state.is_terminal(),
            "{} got pipe_term_ack with peer state {:?}",
            self.id,
            peer_state
        );
        sink.pipe_terminated(self.id);
        self.run_event(Event::PipeTermAck(peer_state));
    }

    fn process_delimiter(&mut self) {
        assert!(self.state.is_readable());
        self.run_event(Event::Delimiter);
    }

    fn close_inbound(&mut self) {
        if let Some(mut inbound) = self.inbound.take() {
            if !self.conflate {
                while inbound.read().is_some() {}
            }
        }
    }

    fn write_delimiter(&mut self) {
        self.out_active = false;
        if self.outbound.is_some() {
            self.rollback();
            if let Some(outbound) = self.outbound.as_mut() {
                outbound.write(Msg::delimiter(), false);
            }
            self.flush();
        }
    }

    fn ack_peer(&mut self) {
        self.send_to_peer(CommandKind::PipeTermAck(self.peer.pipe, self.state));
    }

    fn set_state(&mut self, state: PipeState) {
        trace!("[PIPE] {} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    fn run_event(&mut self, event: Event) {
        use PipeState::{
            Active, DelimiterReceived, TermAckSent, TermReqSent1, TermReqSent2,
            WaitingForDelimiter,
        };

        match (self.state, event) {
            (Active | DelimiterReceived, Event::Terminate) => {
                self.set_state(TermReqSent1);
                self.write_delimiter();
                self.send_to_peer(CommandKind::PipeTerm(self.peer.pipe));
            }
            (Active, Event::PipeTerm) => {
                if self.delay {
                    self.set_state(WaitingForDelimiter);
                } else {
                    self.set_state(TermAckSent);
                    self.outbound = None;
                    self.ack_peer();
                }
            }
            (Active, Event::Delimiter) => self.set_state(DelimiterReceived),

            (WaitingForDelimiter, Event::Terminate) => {
                self.write_delimiter();
                if !self.delay {
                    self.outbound = None;
                    self.set_state(TermAckSent);
                    self.ack_peer();
                }
            }
            (WaitingForDelimiter, Event::Delimiter) | (DelimiterReceived, Event::PipeTerm) => {
                self.outbound = None;
                self.set_state(TermAckSent);
                self.ack_peer();
            }

            (TermReqSent1 | TermReqSent2 | TermAckSent, Event::Terminate) => {}
            (TermReqSent1, Event::PipeTerm) => {
                self.set_state(TermReqSent2);
                self.outbound = None;
                self.ack_peer();
            }
            (TermReqSent1, Event::PipeTermAck(peer_state)) => {
                self.outbound = None;
                if peer_state == TermAckSent {
                    self.ack_peer();
                }
                self.close_inbound();
            }
            (TermReqSent2, Event::PipeTermAck(peer_state)) => {
                assert!(
                    matches!(peer_state, TermReqSent2 | TermAckSent),
                    "{} in TermReqSent2 got ack from peer in {peer_state:?}",
                    self.id
                );
                self.close_inbound();
            }
            (TermAckSent, Event::PipeTermAck(peer_state)) => {
                assert!(
                    matches!(peer_state, TermReqSent1 | TermReqSent2),
                    "{} in TermAckSent got ack from peer in {peer_state:?}",
                    self.id
                );
                self.close_inbound();
            }

            (state, event) => panic!("{}: invalid event {event:?} in state {state:?}", self.id),
        }
    }

    fn send_to_peer(&self, kind: CommandKind) {
        self.bus.send(Command::new(self.peer.host, kind));
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("peer", &self.peer.pipe)
            .field("state", &self.state)
            .field("hwm", &self.hwm)
            .field("lwm", &self.lwm)
            .field("msgs_written", &self.msgs_written)
            .field("msgs_read", &self.msgs_read)
            .finish_non_exhaustive()
    }
}
