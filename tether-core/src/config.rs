//! Tuning constants
//!
//! Defaults shared by the object model. None of these affect correctness;
//! they only trade memory for fewer allocations and thread hops.

use std::time::Duration;

/// Number of commands staged per chunk in a mailbox queue.
///
/// Mailboxes flush after every command, so this mostly bounds how much a
/// single burst of commands allocates up front.
pub const COMMAND_PIPE_GRANULARITY: usize = 16;

/// Number of messages staged per chunk in a pipe queue.
///
/// Larger values amortize the cost of publishing a batch to the reader.
pub const MESSAGE_PIPE_GRANULARITY: usize = 256;

/// Default high water mark for pipes (messages).
pub const DEFAULT_HWM: u32 = 1000;

/// Default linger applied to sockets (milliseconds, -1 = forever).
pub const DEFAULT_LINGER_MS: i32 = -1;

/// How long the reaper sleeps on its own mailbox while it still has adopted
/// sockets whose mailboxes need polling.
pub const REAPER_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Upper bound for the default number of I/O threads.
pub const MAX_DEFAULT_IO_THREADS: usize = 4;

/// Default number of application socket slots in a context.
pub const DEFAULT_MAX_SOCKETS: usize = 1023;

/// Granularity settings for the two queue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Granularity {
    /// Chunk size for command queues (mailboxes)
    pub command: usize,
    /// Chunk size for message queues (pipes)
    pub message: usize,
}

impl Default for Granularity {
    fn default() -> Self {
        Self {
            command: COMMAND_PIPE_GRANULARITY,
            message: MESSAGE_PIPE_GRANULARITY,
        }
    }
}

impl Granularity {
    /// Smallest possible chunks; useful to exercise chunk boundaries in tests.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            command: 1,
            message: 1,
        }
    }
}
