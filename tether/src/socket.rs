//! Application-thread sockets.
//!
//! A socket is the root of an ownership tree and lives on the thread that
//! uses it. It owns one end of every pipe it is connected through, sends
//! round-robin over the writable ones and receives fairly from the readable
//! ones. Commands for the socket pile up in its own mailbox and are processed
//! whenever the application calls into the socket.
//!
//! Closing (or dropping) a socket hands it over to the reaper, which
//! terminates its pipes and children and releases its slot.

use bytes::Bytes;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};

use tether_core::command::{Command, CommandKind, ObjectRef, OwnRef, PipeId, Reaping, ThreadId};
use tether_core::error::{Result, TetherError};
use tether_core::lb::{FairQueue, LoadBalancer, PipeArena};
use tether_core::mailbox::Mailbox;
use tether_core::msg::Msg;
use tether_core::object::{unexpected, CommandBus, Disposition, ObjectNode, Participant, Reapable};
use tether_core::options::{Linger, Options};
use tether_core::own::{Ack, OwnNode, Owned};
use tether_core::pipe::{pipe_pair, Pipe, PipeEvents};

use crate::ctx::Shared;
use crate::inproc::{validate_and_extract_name, Endpoint};

/// Watermark of one direction of an inproc pipe: the sender's send HWM plus
/// the receiver's receive HWM, unbounded if either side is.
fn combined_hwm(send_hwm: u32, recv_hwm: u32) -> u32 {
    if send_hwm == 0 || recv_hwm == 0 {
        0
    } else {
        send_hwm.saturating_add(recv_hwm)
    }
}

fn pipe_target(kind: &CommandKind) -> Option<PipeId> {
    match kind {
        CommandKind::ActivateRead(id)
        | CommandKind::ActivateWrite(id, _)
        | CommandKind::Hiccup(id, _)
        | CommandKind::PipeTerm(id)
        | CommandKind::PipeTermAck(id, _) => Some(*id),
        _ => None,
    }
}

/// Gather the frames of one message from `next`.
///
/// Frames of a message all come through one pipe. When a frame arrives from
/// another pipe, the message being gathered was cut off by its pipe
/// terminating: its frames are dropped and gathering starts over.
fn gather_message(mut next: impl FnMut() -> Result<(PipeId, Msg)>) -> Result<Vec<Bytes>> {
    let mut frames = Vec::new();
    let mut source = None;
    loop {
        let (pipe, msg) = next()?;
        if source.is_some_and(|source| source != pipe) {
            debug!(
                "[SOCKET] dropping {} frames of a message cut off on {:?}",
                frames.len(),
                source
            );
            frames.clear();
        }
        source = Some(pipe);
        let more = msg.has_more();
        frames.push(msg.into_data());
        if !more {
            return Ok(frames);
        }
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|timeout| Instant::now().checked_add(timeout))
}

/// Time left until `deadline`; `Err(WouldBlock)` once it passed.
fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                Err(TetherError::WouldBlock)
            } else {
                Ok(Some(deadline - now))
            }
        }
    }
}

/// Pipe callbacks routed into the socket's distribution state.
struct SocketEvents<'a> {
    own: &'a mut OwnNode,
    lb: &'a mut LoadBalancer,
    fq: &'a mut FairQueue,
    connected: &'a mut HashMap<PipeId, String>,
    disposition: Disposition,
}

impl PipeEvents for SocketEvents<'_> {
    fn read_activated(&mut self, pipe: PipeId) {
        self.fq.activated(pipe);
    }

    fn write_activated(&mut self, pipe: PipeId) {
        self.lb.activated(pipe);
    }

    fn hiccuped(&mut self, pipe: PipeId) {
        trace!("[SOCKET] {} hiccuped", pipe);
    }

    fn pipe_terminated(&mut self, pipe: PipeId) {
        self.lb.terminated(pipe);
        self.fq.terminated(pipe);
        self.connected.remove(&pipe);
        if self.own.is_terminating() {
            self.disposition = self
                .disposition
                .or(self.own.unregister_term_ack(Ack::Pipe(pipe)));
        }
    }
}

/// The participant behind a [`Socket`] handle.
pub(crate) struct SocketCore {
    own: OwnNode,
    shared: Arc<Shared>,
    mailbox: Arc<Mailbox>,
    pipes: PipeArena,
    lb: LoadBalancer,
    fq: FairQueue,
    bound: Vec<String>,
    connected: HashMap<PipeId, String>,
    ctx_terminated: bool,
}

impl SocketCore {
    fn new(shared: Arc<Shared>, tid: ThreadId, options: Options) -> Self {
        let bus = Arc::clone(&shared.bus);
        let mailbox = Arc::clone(bus.mailbox(tid));
        Self {
            own: OwnNode::new(bus, tid, options),
            shared,
            mailbox,
            pipes: PipeArena::new(),
            lb: LoadBalancer::new(),
            fq: FairQueue::new(),
            bound: Vec::new(),
            connected: HashMap::new(),
            ctx_terminated: false,
        }
    }

    fn object_ref(&self) -> ObjectRef {
        self.own.object().object_ref()
    }

    /// Process every pending command, waiting up to `timeout` for the first.
    fn process_commands(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut timeout = timeout;
        while let Some(command) = self.mailbox.recv(timeout)? {
            let disposition = self.process(command.kind);
            debug_assert!(
                !disposition.is_destroy(),
                "socket destroyed outside the reaper"
            );
            timeout = Some(Duration::ZERO);
        }
        if self.ctx_terminated {
            return Err(TetherError::Terminated);
        }
        Ok(())
    }

    fn bind(&mut self, endpoint: &str) -> Result<()> {
        self.process_commands(Some(Duration::ZERO))?;
        let entry = Endpoint::new(self.own.own_ref(), self.own.options());
        let name = self.shared.endpoints.register(endpoint, entry)?;
        self.bound.push(name);
        Ok(())
    }

    fn unbind(&mut self, endpoint: &str) -> Result<()> {
        self.process_commands(Some(Duration::ZERO))?;
        let name = validate_and_extract_name(endpoint)?;
        let Some(index) = self.bound.iter().position(|bound| bound == name) else {
            return Err(TetherError::EndpointNotFound(endpoint.to_owned()));
        };
        let name = self.bound.swap_remove(index);
        self.shared.endpoints.unregister(&name, &self.own.own_ref());
        Ok(())
    }

    fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.process_commands(Some(Duration::ZERO))?;
        let peer = self.shared.endpoints.find(endpoint)?;
        let options = self.own.options();

        // A conflating reader only ever holds one message: never block on it.
        let outbound_hwm = if peer.conflate {
            0
        } else {
            combined_hwm(options.send_hwm, peer.recv_hwm)
        };
        let inbound_hwm = if options.conflate {
            0
        } else {
            combined_hwm(peer.send_hwm, options.recv_hwm)
        };
        let [ours, theirs] = pipe_pair(
            &self.shared.bus,
            [self.object_ref(), peer.socket.object()],
            [outbound_hwm, inbound_hwm],
            [options.conflate, peer.conflate],
        );
        debug!(
            "[SOCKET] {} connected to {} via {}",
            self.object_ref(),
            endpoint,
            ours.id()
        );

        self.connected.insert(ours.id(), endpoint.to_owned());
        self.attach_pipe(ours);
        // The registry already bumped the peer's seqnum.
        self.own.object().send_bind(&peer.socket, theirs, false);
        Ok(())
    }

    fn disconnect(&mut self, endpoint: &str) -> Result<()> {
        self.process_commands(Some(Duration::ZERO))?;
        let ids: Vec<PipeId> = self
            .connected
            .iter()
            .filter(|(_, connected)| connected.as_str() == endpoint)
            .map(|(id, _)| *id)
            .collect();
        if ids.is_empty() {
            return Err(TetherError::EndpointNotFound(endpoint.to_owned()));
        }
        let delay = self.own.options().delay_on_close;
        for id in ids {
            self.connected.remove(&id);
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.terminate(delay);
            }
        }
        Ok(())
    }

    fn attach_pipe(&mut self, mut pipe: Pipe) {
        let id = pipe.id();
        if !self.own.options().delay_on_disconnect {
            pipe.set_no_delay();
        }
        if self.own.is_terminating() {
            // Arrived too late: tear it down right away.
            self.own.register_term_acks(Ack::Pipe(id), 1);
            pipe.terminate(false);
        } else {
            self.lb.attach(id);
            self.fq.attach(id);
        }
        trace!("[SOCKET] {} attached {}", self.object_ref(), id);
        self.pipes.insert(id, pipe);
    }

    fn send(&mut self, msg: Msg) -> Result<()> {
        self.process_commands(Some(Duration::ZERO))?;
        let deadline = deadline(self.own.options().send_timeout);
        loop {
            if self.lb.has_out(&mut self.pipes) {
                // A frame rejected here broke a multi-part message; the rest
                // of it is dropped by the load balancer.
                return match self.lb.send(&mut self.pipes, msg) {
                    Ok(_) => Ok(()),
                    Err(_) => Err(TetherError::WouldBlock),
                };
            }
            self.process_commands(remaining(deadline)?)?;
        }
    }

    /// Next inbound frame and the pipe it came from.
    fn recv(&mut self) -> Result<(PipeId, Msg)> {
        self.process_commands(Some(Duration::ZERO))?;
        let deadline = deadline(self.own.options().recv_timeout);
        loop {
            if let Some(frame) = self.fq.recv(&mut self.pipes) {
                return Ok(frame);
            }
            self.process_commands(remaining(deadline)?)?;
        }
    }

    fn process_pipe_command(&mut self, kind: CommandKind) -> Disposition {
        let Some(id) = pipe_target(&kind) else {
            unexpected(self.own.object(), &kind);
        };
        let Some(pipe) = self.pipes.get_mut(&id) else {
            error!(
                "[SOCKET] {} dropping `{}` for unknown {}",
                self.own.object().object_ref(),
                kind.name(),
                id
            );
            return Disposition::Continue;
        };
        let mut events = SocketEvents {
            own: &mut self.own,
            lb: &mut self.lb,
            fq: &mut self.fq,
            connected: &mut self.connected,
            disposition: Disposition::Continue,
        };
        if pipe.process(kind, &mut events).is_destroy() {
            self.pipes.remove(&id);
        }
        events.disposition
    }

    fn process_term(&mut self, linger: Linger) -> Disposition {
        let own_ref = self.own.own_ref();
        for name in self.bound.drain(..) {
            self.shared.endpoints.unregister(&name, &own_ref);
        }
        for pipe in self.pipes.values_mut() {
            pipe.terminate(false);
            self.own.register_term_acks(Ack::Pipe(pipe.id()), 1);
        }
        self.own.process_term(linger)
    }

    fn hand_to_reaper(self: Box<Self>) {
        let bus = Arc::clone(self.own.object().bus());
        let reaper = self.shared.reaper;
        debug!("[SOCKET] {} closing", self.object_ref());
        bus.send(Command::new(
            reaper,
            CommandKind::Reap(Reaping::Socket(self)),
        ));
    }
}

impl Participant for SocketCore {
    fn object(&self) -> &ObjectNode {
        self.own.object()
    }

    fn process(&mut self, command: CommandKind) -> Disposition {
        let seqnum = command.requires_seqnum();
        let mut disposition = match command {
            CommandKind::Stop(_) => {
                debug!("[SOCKET] {} context terminated", self.object_ref());
                self.ctx_terminated = true;
                Disposition::Continue
            }
            CommandKind::Bind(pipe) => {
                self.attach_pipe(pipe);
                Disposition::Continue
            }
            CommandKind::InprocConnected => Disposition::Continue,
            CommandKind::Own(child) => self.own.process_own(child),
            CommandKind::TermReq(child) => self.own.process_term_req(child),
            CommandKind::TermAck(child) => self.own.process_term_ack(child),
            kind @ (CommandKind::ActivateRead(_)
            | CommandKind::ActivateWrite(..)
            | CommandKind::Hiccup(..)
            | CommandKind::PipeTerm(_)
            | CommandKind::PipeTermAck(..)) => self.process_pipe_command(kind),
            other => unexpected(self.own.object(), &other),
        };
        if seqnum {
            disposition = disposition.or(self.own.process_seqnum());
        }
        disposition
    }
}

impl Owned for SocketCore {
    fn own(&self) -> &OwnNode {
        &self.own
    }

    fn own_mut(&mut self) -> &mut OwnNode {
        &mut self.own
    }
}

impl Reapable for SocketCore {
    fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    fn start_reaping(&mut self) -> Disposition {
        let linger = self.own.options().linger;
        self.process_term(linger)
    }
}

/// Handle to a socket created by [`Context::socket`](crate::ctx::Context::socket).
///
/// A socket is used from one thread at a time. It may be moved to another
/// thread between calls.
///
/// # Errors
///
/// Every operation reports [`TetherError::Terminated`] once the context has
/// started terminating; the socket must then be closed.
pub struct Socket {
    object: ObjectRef,
    core: Option<Box<SocketCore>>,
}

impl Socket {
    pub(crate) fn new(shared: Arc<Shared>, tid: ThreadId, options: Options) -> Self {
        let core = SocketCore::new(shared, tid, options);
        Self {
            object: core.object_ref(),
            core: Some(Box::new(core)),
        }
    }

    fn core(&mut self) -> Result<&mut SocketCore> {
        self.core.as_deref_mut().ok_or(TetherError::Terminated)
    }

    /// Address of the socket on the command bus.
    pub fn object_ref(&self) -> ObjectRef {
        self.object
    }

    /// Bind to an `inproc://` endpoint.
    pub fn bind(&mut self, endpoint: &str) -> Result<()> {
        self.core()?.bind(endpoint)
    }

    /// Stop accepting new connections on `endpoint`. Established pipes stay.
    pub fn unbind(&mut self, endpoint: &str) -> Result<()> {
        self.core()?.unbind(endpoint)
    }

    /// Connect to a bound `inproc://` endpoint.
    ///
    /// The endpoint must already be bound.
    pub fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.core()?.connect(endpoint)
    }

    /// Terminate the pipes created by connecting to `endpoint`.
    pub fn disconnect(&mut self, endpoint: &str) -> Result<()> {
        self.core()?.disconnect(endpoint)
    }

    /// Send one frame, honoring the send timeout.
    ///
    /// On [`TetherError::WouldBlock`] the frame is dropped; if it belonged to
    /// a multi-part message, so are the remaining frames of that message.
    pub fn send(&mut self, msg: Msg) -> Result<()> {
        self.core()?.send(msg)
    }

    /// Send all `frames` as one multi-part message.
    pub fn send_multipart<I>(&mut self, frames: I) -> Result<()>
    where
        I: IntoIterator<Item = Bytes>,
    {
        let core = self.core()?;
        let mut frames = frames.into_iter().peekable();
        while let Some(frame) = frames.next() {
            let more = frames.peek().is_some();
            core.send(Msg::from_data(frame).with_more(more))?;
        }
        Ok(())
    }

    /// Receive one frame, honoring the receive timeout.
    ///
    /// If the peer's pipe terminates after a frame with `MORE` was returned,
    /// the rest of that message is lost and the next frame starts a new
    /// message.
    pub fn recv(&mut self) -> Result<Msg> {
        self.core()?.recv().map(|(_, msg)| msg)
    }

    /// Receive all frames of the next message.
    ///
    /// Only whole messages are returned: frames of a message cut off by its
    /// pipe terminating are dropped.
    pub fn recv_multipart(&mut self) -> Result<Vec<Bytes>> {
        let core = self.core()?;
        gather_message(|| core.recv())
    }

    /// Process pending commands, waiting up to `timeout` for the first one
    /// (`None` waits forever). An elapsed timeout is not an error.
    pub fn process_commands(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.core()?.process_commands(timeout)
    }

    /// Launch a child object on the least loaded I/O thread.
    ///
    /// `build` receives the bus, the chosen thread and this socket's options.
    /// The child is owned by the socket and terminated with it.
    pub fn launch<C, F>(&mut self, build: F) -> Result<OwnRef>
    where
        C: Owned + 'static,
        F: FnOnce(Arc<CommandBus>, ThreadId, Options) -> C,
    {
        let core = self.core()?;
        core.process_commands(Some(Duration::ZERO))?;
        let bus = Arc::clone(&core.shared.bus);
        let tid = bus.choose_io_thread().ok_or(TetherError::NoIoThread)?;
        let child = build(Arc::clone(&bus), tid, core.own.options().clone());
        let child_ref = child.own().own_ref();
        core.own.launch_child(child);
        Ok(child_ref)
    }

    /// Terminate a child launched by this socket.
    pub fn terminate_child(&mut self, child: OwnRef) -> Result<()> {
        let core = self.core()?;
        // The child is only known once its `Own` came back to us.
        core.process_commands(Some(Duration::ZERO))?;
        let disposition = core.own.term_child(child);
        debug_assert!(!disposition.is_destroy());
        Ok(())
    }

    /// Number of pipes attached to the socket, including terminating ones.
    pub fn pipe_count(&self) -> usize {
        self.core.as_ref().map_or(0, |core| core.pipes.len())
    }

    /// Close the socket; the reaper finishes its teardown.
    pub fn close(self) {}
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Some(core) = self.core.take() {
            core.hand_to_reaper();
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("object", &self.object)
            .field("pipes", &self.pipe_count())
            .finish()
    }
}
