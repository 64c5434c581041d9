//! Message frames carried by pipes.
//!
//! A message is one frame of payload plus a few flags. Multi-part messages
//! are sequences of frames where every frame but the last carries `MORE`.
//! Two flag-only frames are internal to the pipe protocol: the delimiter
//! (end of stream) and the credential (absorbed by the reader).

use bytes::Bytes;
use std::fmt;

const MORE: u8 = 0b0001;
const IDENTITY: u8 = 0b0010;
const CREDENTIAL: u8 = 0b0100;
const DELIMITER: u8 = 0b1000;

/// A single message frame.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Msg {
    data: Bytes,
    flags: u8,
}

impl Msg {
    /// Create an empty frame.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: Bytes::new(),
            flags: 0,
        }
    }

    /// Create a frame from any payload that converts into `Bytes`.
    #[must_use]
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: 0,
        }
    }

    /// The end-of-stream sentinel written when a pipe starts terminating.
    #[must_use]
    pub const fn delimiter() -> Self {
        Self {
            data: Bytes::new(),
            flags: DELIMITER,
        }
    }

    /// A credential frame; the reading pipe stores it instead of surfacing it.
    #[must_use]
    pub fn credential(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            flags: CREDENTIAL,
        }
    }

    /// Mark this frame as followed by more frames of the same message.
    #[must_use]
    pub fn with_more(mut self, more: bool) -> Self {
        self.set_more(more);
        self
    }

    /// Mark this frame as an identity frame (not counted against watermarks).
    #[must_use]
    pub fn with_identity(mut self) -> Self {
        self.flags |= IDENTITY;
        self
    }

    pub fn set_more(&mut self, more: bool) {
        if more {
            self.flags |= MORE;
        } else {
            self.flags &= !MORE;
        }
    }

    #[inline]
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.flags & MORE != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.flags & IDENTITY != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_credential(&self) -> bool {
        self.flags & CREDENTIAL != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_delimiter(&self) -> bool {
        self.flags & DELIMITER != 0
    }

    /// Payload of the frame.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Consume the frame and return its payload.
    #[must_use]
    pub fn into_data(self) -> Bytes {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Bytes> for Msg {
    fn from(data: Bytes) -> Self {
        Self::from_data(data)
    }
}

impl From<&'static [u8]> for Msg {
    fn from(data: &'static [u8]) -> Self {
        Self::from_data(Bytes::from_static(data))
    }
}

impl From<&'static str> for Msg {
    fn from(data: &'static str) -> Self {
        Self::from_data(Bytes::from_static(data.as_bytes()))
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_delimiter() {
            return write!(f, "Msg(delimiter)");
        }
        f.debug_struct("Msg")
            .field("len", &self.data.len())
            .field("more", &self.has_more())
            .field("identity", &self.is_identity())
            .field("credential", &self.is_credential())
            .finish()
    }
}
