// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Message decompression for the permessage-deflate extension, mostly
//! conformant with [RFC 7692][rfc7692].
//!
//! The server negotiates `server_no_context_takeover` and
//! `client_no_context_takeover`, so every message is an independent raw
//! deflate stream and no sliding window survives between messages.
//!
//! [rfc7692]: https://tools.ietf.org/html/rfc7692

use crate::runtime::Runtime;
use flate2::{Decompress, FlushDecompress, Status};

/// The extension name in `Sec-WebSocket-Extensions`.
pub const NAME: &str = "permessage-deflate";

/// The parameters the server answers with: no context takeover in
/// either direction.
pub(crate) const RESPONSE_ENTRY: &str =
    "permessage-deflate; server_no_context_takeover; client_no_context_takeover";

/// Appended to each complete message before decompression: the four
/// bytes removed per RFC 7692, section 7.2.2, followed by an empty
/// stored block marked final so the raw deflate stream terminates.
const FLATE_TAIL: [u8; 9] = [0x00, 0x00, 0xFF, 0xFF, 0x01, 0x00, 0x00, 0xFF, 0xFF];

/// Per-message inflater.
///
/// Stateless between messages (no context takeover); kept as a value so
/// the window size stays configurable in one place.
#[derive(Debug)]
pub struct Inflater {
    window_bits: u8
}

impl Inflater {
    /// Create an inflater using the maximum LZ77 window (15 bits),
    /// which decodes the output of any compliant client.
    pub fn new() -> Self {
        Inflater { window_bits: 15 }
    }

    /// Decompress one complete message.
    ///
    /// `data` is the reassembled (still compressed) message payload; it
    /// is extended with the stream tail in place. The decompressed bytes
    /// come back in a buffer from the pool.
    pub fn inflate(
        &self,
        data: &mut Vec<u8>,
        rt: &dyn Runtime
    ) -> Result<Vec<u8>, flate2::DecompressError> {
        if data.is_empty() {
            return Ok(rt.malloc(0))
        }

        data.extend_from_slice(&FLATE_TAIL);

        let mut d = Decompress::new_with_window_bits(false, self.window_bits);
        let mut out = rt.malloc(data.len().saturating_mul(2));
        loop {
            let consumed = d.total_in() as usize;
            if consumed == data.len() {
                break
            }
            if out.capacity() == out.len() {
                out.reserve(std::cmp::max(data.len() - consumed, 256))
            }
            match d.decompress_vec(&data[consumed ..], &mut out, FlushDecompress::Sync)? {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => continue
            }
        }

        log::trace!("inflated {} -> {} bytes", data.len(), out.len());
        Ok(out)
    }
}

impl Default for Inflater {
    fn default() -> Self {
        Inflater::new()
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

/// Compress a message the way a conforming client would: one raw
/// deflate stream, sync-flushed, with the four tail bytes removed
/// (RFC 7692, section 7.2.1).
#[cfg(test)]
pub(crate) fn deflate_message(data: &[u8]) -> Vec<u8> {
    use flate2::{Compress, Compression, FlushCompress};

    let mut c = Compress::new_with_window_bits(Compression::fast(), false, 15);
    let mut out = Vec::with_capacity(data.len() + 64);
    while (c.total_in() as usize) < data.len() {
        let consumed = c.total_in() as usize;
        if out.capacity() == out.len() {
            out.reserve(256)
        }
        c.compress_vec(&data[consumed ..], &mut out, FlushCompress::Sync).unwrap();
    }
    // Drain whatever the flush still holds back.
    loop {
        if out.capacity() == out.len() {
            out.reserve(256)
        }
        let before = out.len();
        c.compress_vec(&[], &mut out, FlushCompress::Sync).unwrap();
        if out.len() == before {
            break
        }
    }
    assert!(out.ends_with(&[0x00, 0x00, 0xFF, 0xFF]));
    let n = out.len() - 4;
    out.truncate(n);
    out
}
