//! JSON codec for envelopes.
//!
//! Encoding produces one complete JSON document per envelope. Decoding works
//! over an accumulating byte buffer: complete documents are split off the
//! front, an incomplete trailing document stays buffered until more bytes
//! arrive.

use bytes::{Buf, BytesMut};
use serde_json::Deserializer;

use super::envelope::Envelope;

pub type CodecError = serde_json::Error;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope)
}

pub fn decode(data: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(data)
}

/// Decodes the next complete envelope at the front of `buf`, consuming its
/// bytes. Returns `Ok(None)` when `buf` holds only whitespace or the start of
/// a document that has not fully arrived yet.
pub fn decode_next(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
    let leading = buf
        .iter()
        .take_while(|b| b.is_ascii_whitespace())
        .count();
    buf.advance(leading);
    if buf.is_empty() {
        return Ok(None);
    }

    let (next, consumed) = {
        let mut stream = Deserializer::from_slice(&buf[..]).into_iter::<Envelope>();
        let next = stream.next();
        (next, stream.byte_offset())
    };
    match next {
        Some(Ok(envelope)) => {
            buf.advance(consumed);
            Ok(Some(envelope))
        }
        Some(Err(err)) if err.is_eof() => Ok(None),
        Some(Err(err)) => Err(err),
        None => Ok(None),
    }
}
