//! Ownership tree termination driven through real mailboxes.
//!
//! A single-threaded pump stands in for the I/O threads: it drains every
//! slot's mailbox, installs handed-off objects and drops destroyed ones.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tether_core::prelude::*;

const SLOTS: u32 = 4;

#[derive(Debug, Clone, Copy)]
struct Destroyed {
    node: ObjectRef,
    owner: Option<ObjectRef>,
}

type Log = Arc<Mutex<Vec<Destroyed>>>;

struct TreeNode {
    own: OwnNode,
    depth: usize,
    fanout: usize,
    log: Log,
}

impl TreeNode {
    fn new(bus: &Arc<CommandBus>, tid: ThreadId, depth: usize, fanout: usize, log: &Log) -> Self {
        Self {
            own: OwnNode::new(Arc::clone(bus), tid, Options::default()),
            depth,
            fanout,
            log: Arc::clone(log),
        }
    }

    fn launch_children(&mut self) {
        if self.depth == 0 {
            return;
        }
        let bus = Arc::clone(self.own.object().bus());
        for i in 0..self.fanout {
            let tid = (self.own.object().tid() + 1 + i as u32) % SLOTS;
            let child = TreeNode::new(&bus, tid, self.depth - 1, self.fanout, &self.log);
            self.own.launch_child(child);
        }
    }
}

impl Participant for TreeNode {
    fn object(&self) -> &ObjectNode {
        self.own.object()
    }

    fn process(&mut self, command: CommandKind) -> Disposition {
        let seqnum = command.requires_seqnum();
        let mut disposition = match command {
            CommandKind::Plug(_) => {
                self.launch_children();
                Disposition::Continue
            }
            CommandKind::Own(child) => self.own.process_own(child),
            CommandKind::TermReq(child) => self.own.process_term_req(child),
            CommandKind::Term(linger) => self.own.process_term(linger),
            CommandKind::TermAck(child) => self.own.process_term_ack(child),
            CommandKind::InprocConnected => Disposition::Continue,
            other => unexpected(self.own.object(), &other),
        };
        if seqnum {
            disposition = disposition.or(self.own.process_seqnum());
        }
        if disposition.is_destroy() {
            self.log.lock().push(Destroyed {
                node: self.own.object().object_ref(),
                owner: self.own.owner().map(OwnRef::object),
            });
        }
        disposition
    }
}

impl Owned for TreeNode {
    fn own(&self) -> &OwnNode {
        &self.own
    }

    fn own_mut(&mut self) -> &mut OwnNode {
        &mut self.own
    }
}

#[derive(Default)]
struct Pump {
    arena: HashMap<ObjectId, Box<dyn Participant>>,
}

impl Pump {
    fn insert(&mut self, participant: impl Participant + 'static) {
        let id = participant.object().id();
        self.arena.insert(id, Box::new(participant));
    }

    /// Deliver at most one command from `tid`; returns whether one was found.
    fn step(&mut self, bus: &CommandBus, tid: ThreadId) -> bool {
        let Some(command) = bus.mailbox(tid).recv(Some(Duration::ZERO)).unwrap() else {
            return false;
        };
        let kind = match command.kind {
            CommandKind::Plug(Some(handoff)) => {
                let participant = handoff.into_inner();
                self.arena.insert(participant.object().id(), participant);
                CommandKind::Plug(None)
            }
            kind => kind,
        };
        let id = command.destination.id;
        let participant = self
            .arena
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no object {id} on slot {tid}"));
        if participant.process(kind).is_destroy() {
            self.arena.remove(&id);
        }
        true
    }

    fn run(&mut self, bus: &CommandBus) {
        loop {
            let mut progressed = false;
            for tid in 0..SLOTS {
                while self.step(bus, tid) {
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }
}

fn bus() -> Arc<CommandBus> {
    Arc::new(CommandBus::new(SLOTS as usize, 0..0, Granularity::default()))
}

#[test]
fn test_tree_terminates_bottom_up() {
    let bus = bus();
    let log = Log::default();
    let root = TreeNode::new(&bus, 0, 3, 3, &log);
    let root_ref = root.own.own_ref();
    let driver = ObjectNode::new(Arc::clone(&bus), 0);

    let mut pump = Pump::default();
    pump.insert(root);
    driver.send_plug(&root_ref, None, true);
    pump.run(&bus);

    // 1 + 3 + 9 + 27
    assert_eq!(pump.arena.len(), 40);

    driver.send_term(&root_ref, Linger::Forever);
    pump.run(&bus);

    assert!(pump.arena.is_empty(), "objects left alive: {}", pump.arena.len());
    let log = log.lock();
    assert_eq!(log.len(), 40);

    // Every owner is destroyed after all of its children.
    let position: HashMap<ObjectRef, usize> =
        log.iter().enumerate().map(|(i, d)| (d.node, i)).collect();
    for (i, destroyed) in log.iter().enumerate() {
        if let Some(owner) = destroyed.owner {
            assert!(position[&owner] > i, "{owner} destroyed before its child");
        }
    }
    assert_eq!(log.last().unwrap().node, root_ref.object());
    assert!(log.last().unwrap().owner.is_none());
}

#[test]
fn test_late_seqnum_commands_delay_destruction() {
    let bus = bus();
    let log = Log::default();
    let root = TreeNode::new(&bus, 0, 0, 0, &log);
    let root_ref = root.own.own_ref();
    let driver = ObjectNode::new(Arc::clone(&bus), 1);

    let mut pump = Pump::default();
    pump.insert(root);

    driver.send_term(&root_ref, Linger::Forever);
    for _ in 0..3 {
        driver.send_inproc_connected(&root_ref);
    }

    // Term: terminating, but three commands are still owed.
    assert!(pump.step(&bus, 0));
    assert_eq!(pump.arena.len(), 1);

    assert!(pump.step(&bus, 0));
    assert!(pump.step(&bus, 0));
    assert_eq!(pump.arena.len(), 1);
    assert!(log.lock().is_empty());

    assert!(pump.step(&bus, 0));
    assert!(pump.arena.is_empty());
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_owner_terminates_child_with_its_linger() {
    let bus = bus();
    let log = Log::default();
    let mut owner = OwnNode::new(
        Arc::clone(&bus),
        0,
        Options::default().with_linger(Linger::IMMEDIATE),
    );
    let child = TreeNode::new(&bus, 1, 0, 0, &log);
    let child_ref = child.own.own_ref();
    owner.launch_child(child);

    let mut pump = Pump::default();
    // Plug installs the child on slot 1.
    assert!(pump.step(&bus, 1));

    // Own comes back to the owner.
    let own = bus.mailbox(0).recv(Some(Duration::ZERO)).unwrap().unwrap();
    let CommandKind::Own(registered) = own.kind else {
        panic!("expected own");
    };
    assert_eq!(registered, child_ref);
    assert_eq!(owner.process_own(registered), Disposition::Continue);
    assert_eq!(owner.process_seqnum(), Disposition::Continue);

    // The owner terminates the child with its own linger.
    assert_eq!(owner.term_child(child_ref.clone()), Disposition::Continue);
    let term = bus.mailbox(1).recv(Some(Duration::ZERO)).unwrap().unwrap();
    assert!(matches!(term.kind, CommandKind::Term(l) if l.is_immediate()));
    bus.send(term);
    assert!(pump.step(&bus, 1));
    assert!(pump.arena.is_empty());

    let ack = bus.mailbox(0).recv(Some(Duration::ZERO)).unwrap().unwrap();
    let CommandKind::TermAck(who) = ack.kind else {
        panic!("expected term_ack");
    };
    assert_eq!(owner.process_term_ack(who), Disposition::Continue);
    assert_eq!(owner.pending_ack_count(), 0);
    assert!(owner.terminate().is_destroy());
}

#[test]
fn test_child_requested_termination_uses_owner_linger() {
    let bus = bus();
    let mut owner = OwnNode::new(
        Arc::clone(&bus),
        0,
        Options::default().with_linger(Linger::IMMEDIATE),
    );
    let mut child = OwnNode::new(
        Arc::clone(&bus),
        1,
        Options::default().with_linger(Linger::Forever),
    );
    child.set_owner(owner.own_ref());
    assert_eq!(owner.process_own(child.own_ref()), Disposition::Continue);

    // The child cannot pick its own linger: it asks the owner.
    assert_eq!(child.terminate(), Disposition::Continue);
    assert!(!child.is_terminating());
    let req = bus.mailbox(0).recv(Some(Duration::ZERO)).unwrap().unwrap();
    assert_eq!(req.destination, owner.object().object_ref());
    let CommandKind::TermReq(requester) = req.kind else {
        panic!("expected term_req");
    };
    assert_eq!(requester, child.own_ref());

    assert_eq!(owner.process_term_req(requester), Disposition::Continue);
    assert_eq!(owner.owned_count(), 0);
    assert_eq!(owner.pending_ack_count(), 1);

    let term = bus.mailbox(1).recv(Some(Duration::ZERO)).unwrap().unwrap();
    let CommandKind::Term(linger) = term.kind else {
        panic!("expected term");
    };
    assert!(linger.is_immediate());
    assert!(child.process_term(linger).is_destroy());

    let ack = bus.mailbox(0).recv(Some(Duration::ZERO)).unwrap().unwrap();
    let CommandKind::TermAck(who) = ack.kind else {
        panic!("expected term_ack");
    };
    assert_eq!(who, child.object().object_ref());
    assert_eq!(owner.process_term_ack(who), Disposition::Continue);
    assert_eq!(owner.pending_ack_count(), 0);

    // A repeated request from the same child is stale.
    assert_eq!(owner.process_term_req(child.own_ref()), Disposition::Continue);
    assert!(bus.mailbox(1).recv(Some(Duration::ZERO)).unwrap().is_none());
}
