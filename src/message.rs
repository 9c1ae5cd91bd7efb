//! Application messages and the routing codes the relay inspects.
//!
//! A message is opaque apart from its first byte (the routing code) and,
//! by convention, its second byte (the sub-code).

use bytes::Bytes;
use std::ops::Deref;

/// Ping request (outbound) and ping reply (inbound).
pub const PING: u8 = b'p';

/// Map/upload status update from the server.
pub const MAP_STATUS: u8 = b'M';

/// Codes the server must acknowledge; always sent on the bulk-reliable path.
pub const ACKNOWLEDGED_CODES: [u8; 2] = [b'O', b'T'];

/// Codes that must never be lost.
pub const RELIABLE_CODES: [u8; 6] = [b'N', b'W', b'Y', b'V', b'E', b'C'];

/// Sentinel routing code for messages too short to carry one.
pub const NO_CODE: u8 = 0;

/// Routing code used when classifying outbound traffic.
///
/// Messages of three bytes or fewer never carry a routing code.
pub fn outbound_code(bytes: &[u8]) -> u8 {
    if bytes.len() > 3 {
        bytes[0]
    } else {
        NO_CODE
    }
}

/// An immutable application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// First byte of the message, if any.
    pub fn code(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Second byte of the message, if any.
    pub fn sub_code(&self) -> Option<u8> {
        self.0.get(1).copied()
    }
}

impl Deref for Message {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Message {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static [u8]> for Message {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}
