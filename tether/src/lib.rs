//! # Tether
//!
//! Message-queue runtime over the [`tether_core`] object model:
//!
//! - **`ctx`**: the [`Context`](ctx::Context) owning the I/O threads, the
//!   reaper and every socket slot
//! - **`socket`**: application-thread sockets exchanging messages over
//!   flow-controlled pipes
//! - **`io_thread`** / **`reaper`**: the threads hosting launched objects and
//!   tearing down closed sockets
//!
//! ## Quick Start
//!
//! ```rust
//! use tether::prelude::*;
//!
//! # fn main() -> tether::Result<()> {
//! let ctx = Context::new(ContextConfig::default())?;
//!
//! let mut server = ctx.socket(Options::default())?;
//! server.bind("inproc://echo")?;
//! let mut client = ctx.socket(Options::default())?;
//! client.connect("inproc://echo")?;
//!
//! client.send(Msg::from("ping"))?;
//! assert_eq!(server.recv()?.data().as_ref(), b"ping");
//!
//! client.close();
//! server.close();
//! ctx.terminate()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod ctx;
pub mod dev_tracing;
mod inproc;
mod io_thread;
mod reaper;
pub mod socket;

pub use tether_core;
pub use tether_core::error::{Result, TetherError};

pub mod prelude {
    pub use crate::ctx::{Context, ContextConfig};
    pub use crate::socket::Socket;
    pub use tether_core::command::OwnRef;
    pub use tether_core::error::{Result, TetherError};
    pub use tether_core::msg::Msg;
    pub use tether_core::options::{Linger, Options};
}
