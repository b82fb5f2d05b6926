//! The opaque byte-and-flag payload carried by SEND operations.

/// A unit of data moving through the simulated network.
///
/// The payload is owned by the operation that carries it: a connection copies
/// the caller's bytes into a fresh `Message` before handing it to the
/// dispatcher, the way a kernel copies a socket write into its own buffer.
/// `eof` marks the end of the stream and doubles as a reset marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    serial: u64,
    payload: Vec<u8>,
    eof: bool,
}

impl Message {
    /// A data message owning `payload`.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            serial: 0,
            payload,
            eof: false,
        }
    }

    /// Copy `bytes` into a new data message.
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }

    /// The end-of-stream marker sent by `close()`.
    pub fn eof() -> Self {
        Self {
            serial: 0,
            payload: Vec::new(),
            eof: true,
        }
    }

    /// Serial number stamped by the dispatcher on acceptance (0 before that).
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Message bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the message bytes.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True when the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// True for the end-of-stream marker.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub(crate) fn stamp(&mut self, serial: u64) {
        self.serial = serial;
    }
}
