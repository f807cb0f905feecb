//! ANT frame codec.
//!
//! A frame is `SYNC, length, id, payload[length], checksum` where the
//! checksum is the XOR of every preceding byte. Frames written by the host
//! are followed by two zero bytes that are not part of the frame.

use std::sync::Arc;

use tracing::{trace, warn};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{Direction, Message, Registry};

pub const SYNC: u8 = 0xA4;
/// Sync, length, id and checksum.
pub const FRAME_OVERHEAD: usize = 4;
/// A frame never spans more than one 64 byte USB packet.
const MAX_FRAME: usize = 64;
const PADDING: [u8; 2] = [0, 0];

#[derive(Copy, Clone, Debug, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct FrameHeader {
    sync: u8,
    length: u8,
    id: u8,
}

#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Translates between [`Message`]s and checksummed frames using a shared
/// [`Registry`].
#[derive(Clone, Debug)]
pub struct Codec {
    registry: Arc<Registry>,
}

impl Codec {
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Frames `msg` for the wire, including the trailing zero padding.
    #[must_use]
    pub fn pack(&self, msg: &Message) -> Vec<u8> {
        let payload = msg.payload();
        #[expect(
            clippy::cast_possible_truncation,
            reason = "payloads are at most a few bytes"
        )]
        let header = FrameHeader {
            sync: SYNC,
            length: payload.len() as u8,
            id: msg.id(),
        };
        let mut frame = header.as_bytes().to_vec();
        frame.extend(payload);
        frame.push(checksum(&frame));
        frame.extend(PADDING);
        trace!("packed {msg}: {frame:02x?}");
        frame
    }

    /// Decodes one device-to-host frame. Invalid frames are logged and
    /// dropped; unknown ids become [`Message::Unimplemented`].
    #[must_use]
    pub fn unpack(&self, frame: &[u8]) -> Option<Message> {
        self.unpack_with(Direction::DeviceToHost, frame)
    }

    /// Like [`Codec::unpack`], for frames travelling in `direction`.
    #[must_use]
    pub fn unpack_with(&self, direction: Direction, frame: &[u8]) -> Option<Message> {
        let Ok((header, _)) = FrameHeader::read_from_prefix(frame) else {
            warn!("dropping short frame: {frame:02x?}");
            return None;
        };
        if header.sync != SYNC {
            warn!("dropping frame without sync byte: {frame:02x?}");
            return None;
        }
        let len = usize::from(header.length) + FRAME_OVERHEAD;
        if frame.len() < len {
            warn!("dropping truncated frame: {frame:02x?}");
            return None;
        }
        let frame = &frame[..len];
        if checksum(frame) != 0 {
            warn!("dropping frame with bad checksum: {frame:02x?}");
            return None;
        }

        let payload = &frame[3..len - 1];
        let Some(descriptor) = self.registry.get(direction, header.id) else {
            return Some(Message::Unimplemented {
                id: header.id,
                data: payload.to_vec(),
            });
        };
        let msg = (descriptor.decode)(payload);
        if msg.is_none() {
            warn!(
                "dropping {} with {} byte payload, expected {}",
                descriptor.name,
                payload.len(),
                descriptor.size
            );
        }
        msg
    }
}

/// Splits a byte stream into frames, keeping partial frames across
/// [`Tokenizer::push`] calls.
#[derive(Clone, Debug, Default)]
pub struct Tokenizer {
    buf: Vec<u8>,
}

impl Tokenizer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next frame whose checksum holds. A sync byte that does
    /// not start a valid frame is dropped and scanning resumes after it, so
    /// stray `0xA4` bytes cost at most the frame they overlap.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let start = self.buf.iter().position(|b| *b == SYNC);
            let skipped = start.unwrap_or(self.buf.len());
            if skipped > 0 {
                if self.buf[..skipped].iter().any(|b| *b != 0) {
                    warn!("resynchronising, skipped {:02x?}", &self.buf[..skipped]);
                }
                self.buf.drain(..skipped);
            }
            let len = usize::from(*self.buf.get(1)?) + FRAME_OVERHEAD;
            if len > MAX_FRAME {
                warn!("ignoring sync byte announcing {len} byte frame");
                self.buf.remove(0);
                continue;
            }
            if self.buf.len() < len {
                return None;
            }
            if checksum(&self.buf[..len]) != 0 {
                warn!("resynchronising after bad checksum: {:02x?}", &self.buf[..len]);
                self.buf.remove(0);
                continue;
            }
            return Some(self.buf.drain(..len).collect());
        }
    }
}

impl Iterator for Tokenizer {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

/// Splits a complete buffer into frames; a trailing partial frame is dropped.
#[must_use]
pub fn tokenize(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut tokenizer = Tokenizer::default();
    tokenizer.push(bytes);
    tokenizer.collect()
}
