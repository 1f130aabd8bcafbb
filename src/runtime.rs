// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Contracts towards the host runtime.
//!
//! The engine is a pure byte-in/calls-out state machine. Everything it
//! needs from the outside world, the non-blocking transport it answers
//! on, the executor that runs user callbacks, and the pooled buffer
//! allocator, comes in through the traits of this module. Plain default
//! implementations ([`Heap`], [`Inline`]) are provided so the engine can
//! be driven without any particular I/O framework.

use std::{io, str, sync::Arc, time::Duration};

/// A task submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send>;

/// The byte transport a connection answers on.
///
/// Writes are expected to be serialized and non-blocking by the host
/// (queued internally if the peer is slow); the engine never awaits
/// completion of a write.
pub trait Transport: Send {
    /// Queue the given bytes for sending.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Set a deadline for flushing queued writes.
    ///
    /// Transports without deadline support may ignore this.
    fn set_write_deadline(&mut self, _after: Duration) -> io::Result<()> {
        Ok(())
    }

    /// Close the transport. Must be idempotent.
    fn close(&mut self);
}

/// A serialized task executor.
///
/// Tasks submitted for one connection must run in submission order;
/// tasks of different connections may run concurrently.
pub trait Executor: Send + Sync {
    /// Submit a task for execution.
    fn execute(&self, task: Task);
}

/// Host runtime services: pooled buffers and payload policies.
pub trait Runtime: Send + Sync {
    /// Allocate a byte buffer with at least the given capacity.
    fn malloc(&self, capacity: usize) -> Vec<u8>;

    /// Return a buffer to the pool.
    fn free(&self, buf: Vec<u8>);

    /// Check that `bytes` are valid UTF-8.
    fn check_utf8(&self, bytes: &[u8]) -> bool {
        str::from_utf8(bytes).is_ok()
    }

    /// If true, payload buffers handed to user callbacks are returned
    /// to the pool as soon as the callback returns.
    fn release_payload(&self) -> bool {
        false
    }
}

/// The HTTP session an upgrade request arrived on.
///
/// A successful handshake takes the raw byte transport out of the
/// session ("hijacking" it from the HTTP machinery). Sessions that
/// cannot give up their transport make the upgrade fail.
pub trait Session {
    /// The transport produced by a successful hijack.
    type Transport: Transport;

    /// The executor running this connection's callbacks.
    fn executor(&self) -> Arc<dyn Executor>;

    /// The host runtime services.
    fn runtime(&self) -> Arc<dyn Runtime>;

    /// Take the raw transport out of the session.
    fn hijack(self) -> Option<Self::Transport>;
}

// Default implementations ////////////////////////////////////////////////////////////////////////

/// Plain heap allocation, no pooling.
#[derive(Debug, Default)]
pub struct Heap;

impl Runtime for Heap {
    fn malloc(&self, capacity: usize) -> Vec<u8> {
        Vec::with_capacity(capacity)
    }

    fn free(&self, buf: Vec<u8>) {
        drop(buf)
    }
}

/// An executor that runs every task right on the submitting thread.
///
/// Submission order and execution order trivially coincide.
#[derive(Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Task) {
        task()
    }
}

// Test doubles ///////////////////////////////////////////////////////////////////////////////////
