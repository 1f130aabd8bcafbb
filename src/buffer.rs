// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The per-connection accumulation buffer.
//!
//! Bytes left over after a read (at most one partially received frame
//! plus whatever trails it) are carried across calls in a pool-allocated
//! buffer. When a read consumes everything no buffer is materialized at
//! all; the caller's chunk is parsed where it lies.

use crate::runtime::Runtime;

/// Append to a pooled vector, growing through the pool when the current
/// allocation is out of capacity.
///
/// Growth is geometric so that byte-at-a-time accumulation stays linear
/// even over pools that hand out exactly sized buffers.
pub(crate) fn append(vec: &mut Vec<u8>, bytes: &[u8], rt: &dyn Runtime) {
    if vec.capacity() - vec.len() >= bytes.len() {
        vec.extend_from_slice(bytes);
        return
    }
    let want = std::cmp::max(vec.len() + bytes.len(), vec.capacity().saturating_mul(2));
    let mut fresh = rt.malloc(want);
    fresh.extend_from_slice(vec);
    fresh.extend_from_slice(bytes);
    rt.free(std::mem::replace(vec, fresh))
}

/// Unparsed bytes carried across reads.
///
/// Empty most of the time; holding bytes only while a frame straddles a
/// chunk boundary.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    buf: Option<Vec<u8>>
}

impl Buffer {
    pub fn new() -> Self {
        Buffer { buf: None }
    }

    pub fn len(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a chunk, growing through the pool when out of capacity.
    pub fn push(&mut self, chunk: &[u8], rt: &dyn Runtime) {
        match self.buf.as_mut() {
            None => {
                let mut b = rt.malloc(chunk.len());
                b.extend_from_slice(chunk);
                self.buf = Some(b)
            }
            Some(b) => append(b, chunk, rt)
        }
    }

    /// Take the accumulated bytes out for parsing, leaving the buffer
    /// empty. Pair with [`Buffer::retain`] afterwards.
    pub fn take(&mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }

    /// Put back what [`Buffer::take`] handed out, keeping only the bytes
    /// after `consumed`.
    ///
    /// A shrunken buffer is never kept around: the residue is copied into
    /// a fresh, tightly sized allocation and the old buffer goes back to
    /// the pool.
    pub fn retain(&mut self, old: Vec<u8>, consumed: usize, rt: &dyn Runtime) {
        debug_assert!(consumed <= old.len());
        if consumed == 0 {
            self.buf = Some(old);
            return
        }
        let residue = &old[consumed ..];
        if residue.is_empty() {
            self.buf = None
        } else {
            let mut fresh = rt.malloc(residue.len());
            fresh.extend_from_slice(residue);
            self.buf = Some(fresh)
        }
        rt.free(old)
    }

    /// Adopt residue from a chunk the engine does not own, promoting it
    /// to a pooled buffer.
    pub fn adopt(&mut self, residue: &[u8], rt: &dyn Runtime) {
        debug_assert!(self.buf.is_none());
        let mut b = rt.malloc(residue.len());
        b.extend_from_slice(residue);
        self.buf = Some(b)
    }

    /// Return the held buffer to the pool.
    pub fn release(&mut self, rt: &dyn Runtime) {
        if let Some(b) = self.buf.take() {
            rt.free(b)
        }
    }
}
