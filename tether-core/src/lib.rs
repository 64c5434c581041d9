//! Tether Core
//!
//! Thread-confined object model underneath the tether runtime:
//! - Exchange queues with flush/wake-up handshake (`queue`)
//! - Per-thread command mailboxes (`mailbox`, `signaler`)
//! - Commands and object addressing (`command`, `object`)
//! - Ownership tree with ordered termination (`own`)
//! - Flow-controlled pipes and their termination handshake (`pipe`)
//! - Load balancing and fair queueing over pipes (`lb`)
//! - Error types (`error`)
//!
//! Objects never share mutable state: each lives on one thread and every
//! cross-thread interaction is a [`command::Command`] delivered through the
//! [`object::CommandBus`].

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::match_same_arms)]

pub mod command;
pub mod config;
pub mod error;
pub mod lb;
pub mod mailbox;
pub mod msg;
pub mod object;
pub mod options;
pub mod own;
pub mod pipe;
pub mod queue;
pub mod signaler;

pub mod prelude {
    pub use crate::command::{
        Command, CommandKind, Handoff, ObjectId, ObjectRef, OwnRef, PipeId, PipeRef, Reaping,
        ThreadId,
    };
    pub use crate::config::Granularity;
    pub use crate::error::{Result, TetherError};
    pub use crate::lb::{FairQueue, LoadBalancer, PipeArena};
    pub use crate::mailbox::Mailbox;
    pub use crate::msg::Msg;
    pub use crate::object::{
        unexpected, CommandBus, Disposition, Engine, ObjectNode, Participant, Reapable,
    };
    pub use crate::options::{Linger, Options};
    pub use crate::own::{Ack, OwnNode, Owned};
    pub use crate::pipe::{pipe_pair, Pipe, PipeEvents, PipeState};
}
