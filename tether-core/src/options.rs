//! Object and socket configuration options
//!
//! Options are copied into every ownership node at creation time. The values
//! mirror libzmq's socket options (`ZMQ_LINGER`, `ZMQ_SNDHWM`, ...) that the
//! object model consumes.

use std::fmt;
use std::time::Duration;

use crate::config::{DEFAULT_HWM, DEFAULT_LINGER_MS};

/// How long a terminating object waits for outbound data to drain.
///
/// Carried by the `Term` command. The owner that starts a (partial) shutdown
/// imposes its own linger on the whole subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linger {
    /// Wait until all pending messages are delivered
    Forever,
    /// Wait at most this long (`Duration::ZERO` drops pending data immediately)
    For(Duration),
}

impl Linger {
    /// Drop pending data immediately.
    pub const IMMEDIATE: Self = Self::For(Duration::ZERO);

    /// Build from libzmq's integer convention: negative means forever,
    /// otherwise milliseconds.
    #[must_use]
    pub fn from_millis(ms: i32) -> Self {
        match u64::try_from(ms) {
            Ok(ms) => Self::For(Duration::from_millis(ms)),
            Err(_) => Self::Forever,
        }
    }

    /// Integer form (milliseconds, -1 for forever).
    #[must_use]
    pub fn as_millis(&self) -> i32 {
        match self {
            Self::Forever => -1,
            Self::For(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        }
    }

    /// True when pending data is discarded without waiting.
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::For(d) if d.is_zero())
    }
}

impl Default for Linger {
    fn default() -> Self {
        Self::from_millis(DEFAULT_LINGER_MS)
    }
}

impl fmt::Display for Linger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => write!(f, "forever"),
            Self::For(d) => write!(f, "{}ms", d.as_millis()),
        }
    }
}

/// Configuration options.
///
/// # Examples
///
/// ```
/// use tether_core::options::{Linger, Options};
/// use std::time::Duration;
///
/// let opts = Options::default()
///     .with_linger(Linger::IMMEDIATE)
///     .with_send_hwm(10)
///     .with_recv_timeout(Duration::from_millis(100));
/// assert_eq!(opts.send_hwm, 10);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Linger period (ZMQ_LINGER)
    ///
    /// Used as the linger of every `Term` this object sends to its children.
    pub linger: Linger,

    /// High water mark for sending (ZMQ_SNDHWM)
    ///
    /// Maximum number of complete messages queued in an outbound pipe.
    /// - Default: 1000 messages
    /// - 0: unbounded
    pub send_hwm: u32,

    /// High water mark for receiving (ZMQ_RCVHWM)
    ///
    /// Bounds the peer's outbound pipe; also drives this side's low watermark.
    /// - Default: 1000 messages
    /// - 0: unbounded
    pub recv_hwm: u32,

    /// Conflate messages (ZMQ_CONFLATE)
    ///
    /// - `false` (default): Queue all messages
    /// - `true`: Keep only the last message in the inbound queue
    pub conflate: bool,

    /// Drain pending inbound messages before acknowledging a peer-initiated
    /// pipe termination.
    ///
    /// - `true` (default): read up to the delimiter first
    /// - `false`: acknowledge immediately and drop pending messages
    pub delay_on_disconnect: bool,

    /// Drain pending inbound messages when this side closes the pipe.
    pub delay_on_close: bool,

    /// Receive timeout (ZMQ_RCVTIMEO)
    ///
    /// - `None`: Block indefinitely (default)
    /// - `Some(Duration::ZERO)`: Non-blocking
    /// - `Some(duration)`: Wait up to duration
    pub recv_timeout: Option<Duration>,

    /// Send timeout (ZMQ_SNDTIMEO)
    ///
    /// - `None`: Block indefinitely (default)
    /// - `Some(Duration::ZERO)`: Non-blocking
    /// - `Some(duration)`: Wait up to duration
    pub send_timeout: Option<Duration>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            linger: Linger::default(),
            send_hwm: DEFAULT_HWM,
            recv_hwm: DEFAULT_HWM,
            conflate: false,
            delay_on_disconnect: true,
            delay_on_close: true,
            recv_timeout: None,
            send_timeout: None,
        }
    }
}

impl Options {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set linger period.
    pub fn with_linger(mut self, linger: Linger) -> Self {
        self.linger = linger;
        self
    }

    /// Set send high water mark.
    pub fn with_send_hwm(mut self, hwm: u32) -> Self {
        self.send_hwm = hwm;
        self
    }

    /// Set receive high water mark.
    pub fn with_recv_hwm(mut self, hwm: u32) -> Self {
        self.recv_hwm = hwm;
        self
    }

    /// Enable message conflation (keep only last message).
    pub fn with_conflate(mut self, enabled: bool) -> Self {
        self.conflate = enabled;
        self
    }

    /// Drain (or drop) pending messages when the peer disconnects.
    pub fn with_delay_on_disconnect(mut self, delay: bool) -> Self {
        self.delay_on_disconnect = delay;
        self
    }

    /// Drain (or drop) pending messages when this side closes.
    pub fn with_delay_on_close(mut self, delay: bool) -> Self {
        self.delay_on_close = delay;
        self
    }

    /// Set receive timeout.
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Set send timeout.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Check if receive operation should be non-blocking.
    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.recv_timeout, Some(d) if d.is_zero())
    }

    /// Check if send operation should be non-blocking.
    pub fn is_send_nonblocking(&self) -> bool {
        matches!(self.send_timeout, Some(d) if d.is_zero())
    }
}
