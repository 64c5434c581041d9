//! Outbound load balancing and inbound fair queueing over a set of pipes.
//!
//! Both keep pipe ids in one vector whose prefix `[..active]` holds the
//! pipes currently usable; deactivating or activating a pipe is a swap
//! across that boundary, so every update is O(1). Pipes themselves live in
//! a [`PipeArena`] owned by the host.

use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::command::PipeId;
use crate::msg::Msg;
use crate::pipe::Pipe;

/// Pipes owned by one host, keyed by id.
pub type PipeArena = HashMap<PipeId, Pipe>;

/// Active-prefix list shared by both balancers.
#[derive(Debug, Default)]
struct ActiveSet {
    pipes: Vec<PipeId>,
    active: usize,
    current: usize,
}

impl ActiveSet {
    fn position(&self, pipe: PipeId) -> Option<usize> {
        self.pipes.iter().position(|&p| p == pipe)
    }

    fn attach_active(&mut self, pipe: PipeId) {
        self.pipes.push(pipe);
        let last = self.pipes.len() - 1;
        self.pipes.swap(last, self.active);
        self.active += 1;
    }

    fn activate(&mut self, pipe: PipeId) {
        let Some(index) = self.position(pipe) else {
            return;
        };
        if index >= self.active {
            self.pipes.swap(index, self.active);
            self.active += 1;
        }
    }

    /// Move the current pipe out of the active prefix.
    fn deactivate_current(&mut self) {
        self.active -= 1;
        self.pipes.swap(self.current, self.active);
        if self.current == self.active {
            self.current = 0;
        }
    }

    /// Forget `pipe`; returns its former index.
    fn remove(&mut self, pipe: PipeId) -> Option<usize> {
        let index = self.position(pipe)?;
        let mut slot = index;
        if index < self.active {
            self.active -= 1;
            self.pipes.swap(index, self.active);
            slot = self.active;
            if self.current == self.active {
                self.current = 0;
            }
        }
        // Only inactive pipes move.
        self.pipes.swap_remove(slot);
        Some(index)
    }

    fn advance(&mut self) {
        self.current += 1;
        if self.current >= self.active {
            self.current = 0;
        }
    }

    fn current(&self) -> PipeId {
        self.pipes[self.current]
    }
}

/// Round-robin sender over active outbound pipes.
///
/// A multi-part message always goes to a single pipe. If that pipe fills up
/// or dies in the middle of a message, the already written frames are rolled
/// back (or the pipe is gone) and the remaining frames are dropped.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    set: ActiveSet,
    more: bool,
    dropping: bool,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new, writable pipe.
    pub fn attach(&mut self, pipe: PipeId) {
        self.set.attach_active(pipe);
    }

    /// A pipe that hit its high watermark became writable again.
    pub fn activated(&mut self, pipe: PipeId) {
        self.set.activate(pipe);
    }

    /// Remove a pipe whose termination completed.
    pub fn terminated(&mut self, pipe: PipeId) {
        let current = self.set.current;
        if let Some(index) = self.set.remove(pipe) {
            if index == current && self.more {
                self.dropping = true;
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.set.pipes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.set.pipes.is_empty()
    }

    /// Send one frame.
    ///
    /// Returns the pipe the frame went to (`None` when it was dropped as part
    /// of a broken multi-part message). When no pipe can take the frame it is
    /// handed back.
    pub fn send(&mut self, arena: &mut PipeArena, msg: Msg) -> Result<Option<PipeId>, Msg> {
        let more = msg.has_more();
        if self.dropping {
            self.more = more;
            self.dropping = more;
            return Ok(None);
        }

        let mut msg = msg;
        while self.set.active > 0 {
            let id = self.set.current();
            let Some(pipe) = arena.get_mut(&id) else {
                self.set.deactivate_current();
                continue;
            };
            match pipe.write(msg) {
                Ok(()) => {
                    self.more = more;
                    if !more {
                        pipe.flush();
                        self.set.advance();
                    }
                    return Ok(Some(id));
                }
                Err(rejected) => msg = rejected,
            }

            if self.more {
                // The pipe filled up mid-message: undo and drop the rest.
                pipe.rollback();
                self.dropping = more;
                self.more = false;
                return Err(msg);
            }
            self.set.deactivate_current();
        }
        Err(msg)
    }

    /// `true` if a frame can be sent right now.
    pub fn has_out(&mut self, arena: &mut PipeArena) -> bool {
        if self.more {
            return true;
        }
        while self.set.active > 0 {
            let writable = arena
                .get_mut(&self.set.current())
                .is_some_and(Pipe::check_write);
            if writable {
                return true;
            }
            self.set.deactivate_current();
        }
        false
    }
}

/// Round-robin receiver over readable inbound pipes.
///
/// All frames of a multi-part message are read from the same pipe before the
/// next pipe gets its turn.
#[derive(Debug, Default)]
pub struct FairQueue {
    set: ActiveSet,
    more: bool,
}

impl FairQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, pipe: PipeId) {
        self.set.attach_active(pipe);
    }

    /// A pipe that was found empty has messages again.
    pub fn activated(&mut self, pipe: PipeId) {
        self.set.activate(pipe);
    }

    pub fn terminated(&mut self, pipe: PipeId) {
        let current = self.set.current;
        if let Some(index) = self.set.remove(pipe) {
            if index == current && self.more {
                // The rest of that message is gone with the pipe.
                self.more = false;
            }
        }
    }

    /// Read the next frame from the current pipe, moving on after the last
    /// frame of each message.
    ///
    /// A pipe that stops being readable in the middle of a multi-part
    /// message (it started terminating) loses the rest of that message; the
    /// next frame returned then starts a new message from another pipe.
    pub fn recv(&mut self, arena: &mut PipeArena) -> Option<(PipeId, Msg)> {
        while self.set.active > 0 {
            let id = self.set.current();
            if let Some(msg) = arena.get_mut(&id).and_then(Pipe::read) {
                self.more = msg.has_more();
                if !self.more {
                    self.set.advance();
                }
                return Some((id, msg));
            }
            if self.more {
                debug!("[FQ] {} cut off inside a multi-part message", id);
                self.more = false;
            } else {
                trace!("[FQ] {} drained", id);
            }
            self.set.deactivate_current();
        }
        None
    }

    /// `true` while the last frame handed out had `MORE` set.
    #[must_use]
    pub fn in_message(&self) -> bool {
        self.more
    }

    /// `true` if a frame can be received right now.
    pub fn has_in(&mut self, arena: &mut PipeArena) -> bool {
        if self.more {
            return true;
        }
        while self.set.active > 0 {
            let readable = arena
                .get_mut(&self.set.current())
                .is_some_and(Pipe::check_read);
            if readable {
                return true;
            }
            self.set.deactivate_current();
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::config::Granularity;
    use crate::object::{CommandBus, ObjectNode};
    use crate::pipe::{pipe_pair, PipeEvents};
    use std::sync::Arc;

    /// Host-side arena plus the peer halves, for `n` pipes of the given hwm.
    fn setup(n: usize, hwm: u32) -> (PipeArena, Vec<Pipe>, Vec<PipeId>) {
        let bus = Arc::new(CommandBus::new(2, 0..0, Granularity::default()));
        let host = ObjectNode::new(Arc::clone(&bus), 0).object_ref();
        let peer = ObjectNode::new(Arc::clone(&bus), 1).object_ref();
        let mut arena = PipeArena::new();
        let mut peers = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..n {
            let [local, remote] = pipe_pair(&bus, [host, peer], [hwm, hwm], [false, false]);
            ids.push(local.id());
            arena.insert(local.id(), local);
            peers.push(remote);
        }
        (arena, peers, ids)
    }

    fn payload(msg: &Msg) -> &[u8] {
        msg.data().as_ref()
    }

    #[test]
    fn test_round_robin() {
        let (mut arena, mut peers, ids) = setup(2, 0);
        let mut lb = LoadBalancer::new();
        for &id in &ids {
            lb.attach(id);
        }

        let first = lb.send(&mut arena, Msg::from("a")).unwrap();
        let second = lb.send(&mut arena, Msg::from("b")).unwrap();
        let third = lb.send(&mut arena, Msg::from("c")).unwrap();
        assert_ne!(first, second);
        assert_eq!(first, third);

        let total: usize = peers
            .iter_mut()
            .map(|p| std::iter::from_fn(|| p.read()).count())
            .sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_multipart_stays_on_one_pipe() {
        let (mut arena, _peers, ids) = setup(2, 0);
        let mut lb = LoadBalancer::new();
        for &id in &ids {
            lb.attach(id);
        }

        let a = lb.send(&mut arena, Msg::from("1").with_more(true)).unwrap();
        let b = lb.send(&mut arena, Msg::from("2").with_more(true)).unwrap();
        let c = lb.send(&mut arena, Msg::from("3")).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_ne!(lb.send(&mut arena, Msg::from("next")).unwrap(), c);
    }

    #[test]
    fn test_full_pipe_is_skipped_until_activated() {
        let (mut arena, _peers, ids) = setup(2, 1);
        let mut lb = LoadBalancer::new();
        for &id in &ids {
            lb.attach(id);
        }

        lb.send(&mut arena, Msg::from("a")).unwrap();
        lb.send(&mut arena, Msg::from("b")).unwrap();
        let rejected = lb.send(&mut arena, Msg::from("c")).unwrap_err();
        assert_eq!(payload(&rejected), b"c");
        assert!(!lb.has_out(&mut arena));

        // Simulate the peer catching up on one pipe.
        let pipe = arena.get_mut(&ids[0]).unwrap();
        let mut sink = NullSink;
        let _ = pipe.process(CommandKind::ActivateWrite(ids[0], 1), &mut sink);
        lb.activated(ids[0]);
        assert!(lb.has_out(&mut arena));
        assert_eq!(lb.send(&mut arena, rejected).unwrap(), Some(ids[0]));
    }

    #[test]
    fn test_terminated_mid_message_drops_the_rest() {
        let (mut arena, _peers, ids) = setup(1, 0);
        let mut lb = LoadBalancer::new();
        lb.attach(ids[0]);

        lb.send(&mut arena, Msg::from("head").with_more(true)).unwrap();
        lb.terminated(ids[0]);
        arena.remove(&ids[0]);
        assert!(lb.is_empty());

        // Remaining frames of the broken message vanish silently.
        assert_eq!(lb.send(&mut arena, Msg::from("body").with_more(true)), Ok(None));
        assert_eq!(lb.send(&mut arena, Msg::from("tail")), Ok(None));
        // The next message has nowhere to go.
        assert!(lb.send(&mut arena, Msg::from("next")).is_err());
    }

    #[test]
    fn test_fair_queue_alternates_between_pipes() {
        let (mut arena, mut remotes, ids) = setup(2, 0);
        for remote in &mut remotes {
            remote.write(Msg::from("x")).unwrap();
            remote.write(Msg::from("y")).unwrap();
            remote.flush();
        }

        let mut fq = FairQueue::new();
        for &id in &ids {
            fq.attach(id);
        }
        let order: Vec<PipeId> = std::iter::from_fn(|| fq.recv(&mut arena))
            .map(|(id, _)| id)
            .collect();
        assert_eq!(order.len(), 4);
        assert_ne!(order[0], order[1]);
        assert_eq!(order[0], order[2]);
        assert!(!fq.has_in(&mut arena));
    }

    #[test]
    fn test_fair_queue_reads_whole_multipart() {
        let (mut arena, mut remotes, ids) = setup(2, 0);
        remotes[0].write(Msg::from("a1").with_more(true)).unwrap();
        remotes[0].write(Msg::from("a2")).unwrap();
        remotes[0].flush();
        remotes[1].write(Msg::from("b")).unwrap();
        remotes[1].flush();

        let mut fq = FairQueue::new();
        fq.attach(ids[0]);
        fq.attach(ids[1]);

        let (first_pipe, first) = fq.recv(&mut arena).unwrap();
        assert_eq!(first_pipe, ids[0]);
        assert!(first.has_more());
        let (second_pipe, second) = fq.recv(&mut arena).unwrap();
        assert_eq!(second_pipe, ids[0]);
        assert_eq!(payload(&second), b"a2");
        assert_eq!(fq.recv(&mut arena).unwrap().0, ids[1]);
    }

    #[test]
    fn test_fair_queue_survives_pipe_cut_mid_message() {
        let (mut arena, mut remotes, ids) = setup(2, 0);
        remotes[0].write(Msg::from("a1").with_more(true)).unwrap();
        remotes[0].write(Msg::from("a2")).unwrap();
        remotes[0].flush();
        remotes[1].write(Msg::from("b")).unwrap();
        remotes[1].flush();

        let mut fq = FairQueue::new();
        fq.attach(ids[0]);
        fq.attach(ids[1]);

        let (first_pipe, first) = fq.recv(&mut arena).unwrap();
        assert_eq!(first_pipe, ids[0]);
        assert!(first.has_more());
        assert!(fq.in_message());

        // Local termination without delay: the rest of the inbound queue is
        // no longer readable.
        arena.get_mut(&ids[0]).unwrap().terminate(false);

        let (next_pipe, next) = fq.recv(&mut arena).unwrap();
        assert_eq!(next_pipe, ids[1]);
        assert_eq!(payload(&next), b"b");
        assert!(!fq.in_message());
        assert!(fq.recv(&mut arena).is_none());
    }

    #[test]
    fn test_fair_queue_pipe_cut_with_nothing_else_to_read() {
        let (mut arena, mut remotes, ids) = setup(1, 0);
        remotes[0].write(Msg::from("a1").with_more(true)).unwrap();
        remotes[0].write(Msg::from("a2")).unwrap();
        remotes[0].flush();

        let mut fq = FairQueue::new();
        fq.attach(ids[0]);
        assert!(fq.recv(&mut arena).unwrap().1.has_more());

        arena.get_mut(&ids[0]).unwrap().terminate(false);
        assert!(fq.recv(&mut arena).is_none());
        assert!(!fq.in_message());
        assert!(!fq.has_in(&mut arena));
    }

    struct NullSink;

    impl PipeEvents for NullSink {
        fn read_activated(&mut self, _: PipeId) {}
        fn write_activated(&mut self, _: PipeId) {}
        fn hiccuped(&mut self, _: PipeId) {}
        fn pipe_terminated(&mut self, _: PipeId) {}
    }
}
