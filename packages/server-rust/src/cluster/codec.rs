//! Framing for exchange messages.
//!
//! A frame is one flag byte followed by the `MsgPack` body. When the
//! compressed flag is set the body is gzip-compressed; peers only receive
//! compressed frames if they advertise support for it.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;

const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Encodes `msg` into a frame, compressing the body when asked.
///
/// # Errors
///
/// Returns [`TransportError::Codec`] if serialization or compression fails.
pub fn encode<T: Serialize>(msg: &T, compress: bool) -> Result<Bytes, TransportError> {
    let body = rmp_serde::to_vec_named(msg).map_err(|e| TransportError::Codec(e.to_string()))?;

    let (flags, body) = if compress {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&body)
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        (FLAG_COMPRESSED, compressed)
    } else {
        (0, body)
    };

    let mut frame = BytesMut::with_capacity(body.len() + 1);
    frame.put_u8(flags);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Decodes a frame produced by [`encode`].
///
/// # Errors
///
/// Returns [`TransportError::Codec`] for empty frames, bad compression, or
/// bodies that do not deserialize into `T`.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T, TransportError> {
    let (&flags, body) = frame
        .split_first()
        .ok_or_else(|| TransportError::Codec("empty frame".to_string()))?;

    if flags & FLAG_COMPRESSED == 0 {
        return rmp_serde::from_slice(body).map_err(|e| TransportError::Codec(e.to_string()));
    }

    let mut decoder = GzDecoder::new(body);
    let mut raw = Vec::new();
    decoder
        .read_to_end(&mut raw)
        .map_err(|e| TransportError::Codec(e.to_string()))?;
    rmp_serde::from_slice(&raw).map_err(|e| TransportError::Codec(e.to_string()))
}

/// `true` if the frame body is compressed.
#[must_use]
pub fn is_compressed(frame: &[u8]) -> bool {
    frame.first().is_some_and(|f| f & FLAG_COMPRESSED != 0)
}
