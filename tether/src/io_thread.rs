//! I/O thread: an OS thread hosting participants that were launched onto it.
//!
//! The thread blocks on its mailbox and hands every command to the object it
//! is addressed to. Objects arrive inside `Plug` commands and leave when they
//! report [`Disposition::Destroy`]. Commands addressed to the thread itself
//! drive its shutdown: `Stop` hands the thread over to the reaper, `Reaped`
//! ends the loop.

use hashbrown::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, trace, warn};

use tether_core::command::{Command, CommandKind, ObjectId, ObjectRef, Reaping, ThreadId};
use tether_core::error::{Result, TetherError};
use tether_core::object::{unexpected, CommandBus, Disposition, ObjectNode, Participant};

pub(crate) struct IoThread {
    object: ObjectNode,
    reaper: ObjectRef,
    arena: HashMap<ObjectId, Box<dyn Participant>>,
}

impl IoThread {
    pub(crate) fn new(bus: Arc<CommandBus>, tid: ThreadId, reaper: ObjectRef) -> Self {
        Self {
            object: ObjectNode::new(bus, tid),
            reaper,
            arena: HashMap::new(),
        }
    }

    pub(crate) fn object_ref(&self) -> ObjectRef {
        self.object.object_ref()
    }

    pub(crate) fn spawn(self) -> Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("tether-io-{}", self.object.tid()))
            .spawn(move || self.run())
            .map_err(TetherError::Io)
    }

    fn run(mut self) {
        let mailbox = Arc::clone(self.object.bus().mailbox(self.object.tid()));
        debug!("[IO] {} started", self.object_ref());
        loop {
            let command = match mailbox.recv(None) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(e) => {
                    warn!("[IO] {} mailbox failed: {}", self.object_ref(), e);
                    break;
                }
            };
            if command.destination == self.object_ref() {
                if self.process_own_command(command.kind) {
                    break;
                }
            } else {
                self.dispatch(command);
            }
        }
        if !self.arena.is_empty() {
            warn!(
                "[IO] {} exits with {} live objects",
                self.object_ref(),
                self.arena.len()
            );
        }
        debug!("[IO] {} stopped", self.object_ref());
    }

    /// Returns `true` once the thread may exit.
    fn process_own_command(&mut self, kind: CommandKind) -> bool {
        match kind {
            CommandKind::Stop(_) => {
                debug!("[IO] {} stopping", self.object_ref());
                self.object
                    .send_reap(self.reaper, Reaping::Thread(self.object_ref()));
                false
            }
            CommandKind::Reaped(_) => true,
            other => unexpected(&self.object, &other),
        }
    }

    fn dispatch(&mut self, command: Command) {
        let Command { destination, kind } = command;
        let kind = match kind {
            CommandKind::Plug(Some(handoff)) => {
                let participant = handoff.into_inner();
                trace!("[IO] {} adopts {}", self.object_ref(), destination);
                self.arena.insert(destination.id, participant);
                self.object.bus().load_increased(self.object.tid());
                CommandKind::Plug(None)
            }
            kind => kind,
        };

        let Some(participant) = self.arena.get_mut(&destination.id) else {
            error!(
                "[IO] {} dropping `{}` for unknown object {}",
                self.object_ref(),
                kind.name(),
                destination
            );
            return;
        };
        if participant.process(kind) == Disposition::Destroy {
            self.arena.remove(&destination.id);
            self.object.bus().load_decreased(self.object.tid());
            trace!("[IO] {} released {}", self.object_ref(), destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::command::Handoff;
    use tether_core::config::Granularity;

    struct Counter {
        object: ObjectNode,
        hits: flume::Sender<usize>,
        seen: usize,
    }

    impl Participant for Counter {
        fn object(&self) -> &ObjectNode {
            &self.object
        }

        fn process(&mut self, command: CommandKind) -> Disposition {
            match command {
                CommandKind::Plug(None) => Disposition::Continue,
                CommandKind::InprocConnected => {
                    self.seen += 1;
                    let _ = self.hits.send(self.seen);
                    if self.seen == 3 {
                        Disposition::Destroy
                    } else {
                        Disposition::Continue
                    }
                }
                other => unexpected(&self.object, &other),
            }
        }
    }

    #[test]
    fn test_hosts_objects_until_destroyed_then_stops() {
        let bus = Arc::new(CommandBus::new(3, 2..3, Granularity::default()));
        let reaper = ObjectNode::new(Arc::clone(&bus), 1);
        let io = IoThread::new(Arc::clone(&bus), 2, reaper.object_ref());
        let io_ref = io.object_ref();
        let handle = io.spawn().unwrap();

        let (tx, rx) = flume::unbounded();
        let counter = Counter {
            object: ObjectNode::new(Arc::clone(&bus), 2),
            hits: tx,
            seen: 0,
        };
        let counter_ref = counter.object().object_ref();
        reaper.send(counter_ref, CommandKind::Plug(Some(Handoff::new(counter))));
        for _ in 0..3 {
            reaper.send(counter_ref, CommandKind::InprocConnected);
        }
        for expected in 1..=3 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), expected);
        }

        reaper.send_stop(io_ref);
        let reap = bus.mailbox(1).recv(Some(Duration::from_secs(5))).unwrap().unwrap();
        assert!(matches!(reap.kind, CommandKind::Reap(Reaping::Thread(r)) if r == io_ref));
        reaper.send_reaped(io_ref);
        handle.join().unwrap();
        assert_eq!(bus.load(2), 0);
    }
}
