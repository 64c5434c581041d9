//! Ownership tree and the termination protocol.
//!
//! Every object that takes part in orderly shutdown embeds an [`OwnNode`].
//! A node terminates only after:
//!
//! 1. it was asked to (by its owner, or by itself when it is the root),
//! 2. every child it owned has acknowledged its own termination,
//! 3. every other registered event (pipe terminations, ...) has been
//!    acknowledged,
//! 4. every command sent to it with a sequence number bump has been
//!    processed.
//!
//! Only then does it report [`Disposition::Destroy`], after sending
//! `TermAck` to its owner.

use hashbrown::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::command::{Handoff, ObjectRef, OwnRef, PipeId, ThreadId};
use crate::object::{CommandBus, Disposition, ObjectNode, Participant};
use crate::options::{Linger, Options};

/// Something a terminating node waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ack {
    /// A child's `TermAck`.
    Child(ObjectRef),
    /// Termination of one of the node's pipes.
    Pipe(PipeId),
}

/// Per-object ownership state. Touched only by the owning thread, except for
/// the shared send-side sequence counter.
pub struct OwnNode {
    object: ObjectNode,
    options: Options,
    terminating: bool,
    destroyed: bool,
    send_seqnum: Arc<AtomicU64>,
    processed_seqnum: u64,
    owner: Option<OwnRef>,
    owned: HashSet<OwnRef>,
    pending_acks: HashMap<Ack, usize>,
}

impl OwnNode {
    pub fn new(bus: Arc<CommandBus>, tid: ThreadId, options: Options) -> Self {
        Self {
            object: ObjectNode::new(bus, tid),
            options,
            terminating: false,
            destroyed: false,
            send_seqnum: Arc::new(AtomicU64::new(0)),
            processed_seqnum: 0,
            owner: None,
            owned: HashSet::new(),
            pending_acks: HashMap::new(),
        }
    }

    #[must_use]
    pub fn object(&self) -> &ObjectNode {
        &self.object
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    /// Shareable address of this node.
    #[must_use]
    pub fn own_ref(&self) -> OwnRef {
        OwnRef::new(self.object.object_ref(), Arc::clone(&self.send_seqnum))
    }

    #[must_use]
    pub fn owner(&self) -> Option<&OwnRef> {
        self.owner.as_ref()
    }

    /// Set the owner. Done once, before the node is launched.
    ///
    /// # Panics
    ///
    /// Panics if the node already has an owner.
    pub fn set_owner(&mut self, owner: OwnRef) {
        assert!(
            self.owner.is_none(),
            "object {} already owned",
            self.object.object_ref()
        );
        self.owner = Some(owner);
    }

    #[must_use]
    pub const fn is_terminating(&self) -> bool {
        self.terminating
    }

    /// Announce one more in-flight command addressed to this node.
    pub fn inc_seqnum(&self) {
        self.send_seqnum.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of commands still owed to this node.
    #[must_use]
    pub fn pending_seqnums(&self) -> u64 {
        self.send_seqnum
            .load(Ordering::Acquire)
            .saturating_sub(self.processed_seqnum)
    }

    /// Number of children owned and not yet asked to terminate.
    #[must_use]
    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    /// Number of outstanding acknowledgements.
    #[must_use]
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.values().sum()
    }

    /// Account for one processed seqnum command.
    ///
    /// Called after a `Plug`, `Own`, `Attach`, `Bind` or `InprocConnected`
    /// was handled.
    pub fn process_seqnum(&mut self) -> Disposition {
        self.processed_seqnum += 1;
        self.check_term_acks()
    }

    /// Take ownership of `child` and start it on its own thread.
    ///
    /// The child object moves into the `Plug` command; the `Own` command
    /// comes back to this node and registers the child.
    pub fn launch_child<C>(&mut self, mut child: C)
    where
        C: Owned + 'static,
    {
        child.own_mut().set_owner(self.own_ref());
        let child_ref = child.own().own_ref();
        debug!(
            "[OWN] {} launches {}",
            self.object.object_ref(),
            child_ref.object()
        );
        self.object
            .send_plug(&child_ref, Some(Handoff::new(child)), true);
        self.object.send_own(&self.own_ref(), child_ref);
    }

    /// A launched child reached its owner.
    pub fn process_own(&mut self, child: OwnRef) -> Disposition {
        if self.terminating {
            // Too late to live: terminate it right away.
            self.register_term_acks(Ack::Child(child.object()), 1);
            self.object.send_term(&child, Linger::IMMEDIATE);
            return Disposition::Continue;
        }
        self.owned.insert(child);
        Disposition::Continue
    }

    /// Ask for this node to be terminated.
    ///
    /// The root terminates itself with its own linger; everyone else asks its
    /// owner, which decides the linger of the whole subtree.
    pub fn terminate(&mut self) -> Disposition {
        if self.terminating {
            return Disposition::Continue;
        }
        match &self.owner {
            None => {
                let linger = self.options.linger;
                self.process_term(linger)
            }
            Some(owner) => {
                self.object.send_term_req(owner, self.own_ref());
                Disposition::Continue
            }
        }
    }

    /// Terminate one of our children.
    pub fn term_child(&mut self, child: OwnRef) -> Disposition {
        self.process_term_req(child)
    }

    /// A child asked to be terminated.
    pub fn process_term_req(&mut self, child: OwnRef) -> Disposition {
        if !self.owned.remove(&child) {
            trace!(
                "[OWN] {} ignores stale term request from {}",
                self.object.object_ref(),
                child.object()
            );
            return Disposition::Continue;
        }
        self.register_term_acks(Ack::Child(child.object()), 1);
        self.object.send_term(&child, self.options.linger);
        if self.terminating {
            self.check_term_acks()
        } else {
            Disposition::Continue
        }
    }

    /// Start terminating: pass `linger` down to every child and wait for
    /// their acknowledgements.
    ///
    /// # Panics
    ///
    /// Panics if the node is already terminating.
    pub fn process_term(&mut self, linger: Linger) -> Disposition {
        assert!(
            !self.terminating,
            "object {} terminated twice",
            self.object.object_ref()
        );
        debug!(
            "[OWN] {} terminating, {} children, linger {}",
            self.object.object_ref(),
            self.owned.len(),
            linger
        );
        let children: Vec<OwnRef> = self.owned.drain().collect();
        for child in &children {
            self.object.send_term(child, linger);
            self.register_term_acks(Ack::Child(child.object()), 1);
        }
        self.terminating = true;
        self.check_term_acks()
    }

    /// Wait for `count` more acknowledgements of `ack`.
    pub fn register_term_acks(&mut self, ack: Ack, count: usize) {
        if count > 0 {
            *self.pending_acks.entry(ack).or_insert(0) += count;
        }
    }

    /// One acknowledgement of `ack` arrived.
    ///
    /// # Panics
    ///
    /// Panics if no such acknowledgement was pending.
    pub fn unregister_term_ack(&mut self, ack: Ack) -> Disposition {
        match self.pending_acks.get_mut(&ack) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pending_acks.remove(&ack);
            }
            None => panic!(
                "object {} got unexpected ack {:?}",
                self.object.object_ref(),
                ack
            ),
        }
        self.check_term_acks()
    }

    /// A child finished terminating.
    pub fn process_term_ack(&mut self, child: ObjectRef) -> Disposition {
        self.unregister_term_ack(Ack::Child(child))
    }

    /// Destroy the node if it is terminating and nothing is outstanding.
    pub fn check_term_acks(&mut self) -> Disposition {
        if self.destroyed
            || !self.terminating
            || !self.owned.is_empty()
            || !self.pending_acks.is_empty()
            || self.pending_seqnums() > 0
        {
            return Disposition::Continue;
        }
        if let Some(owner) = &self.owner {
            self.object.send_term_ack(owner);
        }
        self.destroyed = true;
        debug!("[OWN] {} destroyed", self.object.object_ref());
        Disposition::Destroy
    }
}

impl std::fmt::Debug for OwnNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnNode")
            .field("object", &self.object.object_ref())
            .field("terminating", &self.terminating)
            .field("owned", &self.owned.len())
            .field("pending_acks", &self.pending_ack_count())
            .field("pending_seqnums", &self.pending_seqnums())
            .finish()
    }
}

/// A participant that is part of the ownership tree.
pub trait Owned: Participant {
    fn own(&self) -> &OwnNode;
    fn own_mut(&mut self) -> &mut OwnNode;
}
