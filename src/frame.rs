//! Length-prefixed two-segment frame codec.
//!
//! A frame carries one header message and at most one payload message:
//!
//! ```text
//! offset 0: u32 header_size   (little-endian)
//! offset 4: u32 payload_size
//! offset 8: header bytes
//! offset 8 + header_size: payload bytes (absent when payload_size = 0)
//! ```
//!
//! The size fields are little-endian on the wire so frames are
//! interoperable across peers regardless of host byte order. Both
//! primitives operate over a fixed-capacity buffer owned by the
//! `FrameBuffer`; the framing itself never allocates, only payload
//! materialization does.

use std::sync::Arc;

use crate::error::ProtocolError;
use crate::registry::{AnyPayload, MessageRegistry};

/// Byte length of the two size fields.
const FRAME_PREFIX: usize = 8;

/// Default frame capacity: 64 KiB.
pub const DEFAULT_FRAME_CAPACITY: usize = 64 * 1024;

/// Fixed-capacity frame encoder/decoder bound to a message registry.
pub struct FrameBuffer {
    buf: Vec<u8>,
    written: usize,
    registry: Arc<MessageRegistry>,
}

impl FrameBuffer {
    pub fn new(registry: Arc<MessageRegistry>) -> Self {
        Self::with_capacity(registry, DEFAULT_FRAME_CAPACITY)
    }

    pub fn with_capacity(registry: Arc<MessageRegistry>, capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            written: 0,
            registry,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid bytes currently in the buffer.
    pub fn written(&self) -> usize {
        self.written
    }

    /// The encoded frame.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.written]
    }

    pub fn reset(&mut self) {
        self.written = 0;
    }

    /// Copy an inbound frame into the buffer.
    pub fn fill_from(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        if bytes.len() > self.buf.len() {
            return Err(ProtocolError::Overflow {
                needed: bytes.len(),
                capacity: self.buf.len(),
            });
        }
        self.buf[..bytes.len()].copy_from_slice(bytes);
        self.written = bytes.len();
        Ok(())
    }

    /// Serialize `header` and an optional payload into the buffer,
    /// returning the total frame length.
    pub fn write<H: prost::Message>(
        &mut self,
        header: &H,
        payload: Option<&dyn AnyPayload>,
    ) -> Result<usize, ProtocolError> {
        self.reset();
        let capacity = self.buf.len();

        let header_len = header.encoded_len();
        if FRAME_PREFIX + header_len > capacity {
            return Err(ProtocolError::Overflow {
                needed: FRAME_PREFIX + header_len,
                capacity,
            });
        }
        {
            let mut dst = &mut self.buf[FRAME_PREFIX..FRAME_PREFIX + header_len];
            header.encode(&mut dst)?;
        }

        let payload_len = match payload {
            None => 0,
            Some(payload) => {
                let len = payload.encoded_len();
                let needed = FRAME_PREFIX + header_len + len;
                if needed > capacity {
                    return Err(ProtocolError::Overflow { needed, capacity });
                }
                payload.encode_to(
                    &mut self.buf[FRAME_PREFIX + header_len..FRAME_PREFIX + header_len + len],
                )?;
                len
            }
        };

        self.buf[0..4].copy_from_slice(&(header_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&(payload_len as u32).to_le_bytes());
        self.written = FRAME_PREFIX + header_len + payload_len;
        Ok(self.written)
    }

    /// Parse the buffer as a frame with header type `H`.
    ///
    /// `selector` maps the parsed header to the registered id of the
    /// payload, letting one header type announce many payload types. It
    /// is consulted only when `payload_size > 0`.
    pub fn read<H: prost::Message + Default>(
        &self,
        selector: impl Fn(&H) -> u32,
    ) -> Result<(H, Option<Box<dyn AnyPayload>>), ProtocolError> {
        if self.written < FRAME_PREFIX {
            return Err(ProtocolError::Truncated {
                expected: FRAME_PREFIX,
                actual: self.written,
            });
        }

        let mut size = [0u8; 4];
        size.copy_from_slice(&self.buf[0..4]);
        let header_len = u32::from_le_bytes(size) as usize;
        size.copy_from_slice(&self.buf[4..8]);
        let payload_len = u32::from_le_bytes(size) as usize;

        let total = FRAME_PREFIX + header_len + payload_len;
        if self.written < total {
            return Err(ProtocolError::Truncated {
                expected: total,
                actual: self.written,
            });
        }

        let header = H::decode(&self.buf[FRAME_PREFIX..FRAME_PREFIX + header_len]).map_err(
            |source| ProtocolError::Decode {
                name: std::any::type_name::<H>().to_owned(),
                source,
            },
        )?;

        let payload = if payload_len == 0 {
            None
        } else {
            let id = selector(&header);
            let start = FRAME_PREFIX + header_len;
            Some(self.registry.decode(id, &self.buf[start..start + payload_len])?)
        };

        Ok((header, payload))
    }
}
