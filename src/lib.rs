// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A push-driven, server-side implementation of the [RFC6455][rfc6455]
//! websocket protocol, made to sit on top of a non-blocking, event-driven
//! byte transport.
//!
//! Unlike pull-based codecs, nothing in here reads from a socket: the
//! host's event loop hands every received chunk to
//! [`Connection::on_read`] and the engine parses frames, reassembles
//! messages (inflating them if permessage-deflate was negotiated),
//! validates protocol conformance and dispatches the results to user
//! callbacks through a serialized per-connection executor. The HTTP
//! upgrade is performed once, up front, by an [`Upgrader`] over a request
//! the host's HTTP parser has already parsed.
//!
//! # Basic Usage
//!
//! ```ignore
//! let mut settings = Settings::new();
//! settings.on_message(|opcode, data| { /* ... */ });
//! let settings = Arc::new(settings);
//!
//! // For every upgrade request the HTTP server hands us:
//! let mut upgrader = Upgrader::new(settings.clone());
//! let mut conn = upgrader.upgrade(&request, &[], session)?;
//!
//! // And from then on, for every chunk the event loop reads:
//! conn.on_read(&mut chunk)?;
//! ```
//!
//! [rfc6455]: https://tools.ietf.org/html/rfc6455

#![deny(missing_docs)]

pub mod base;
pub mod connection;
#[cfg(feature = "deflate")]
pub mod extension;
pub mod handshake;
pub mod http;
pub mod runtime;
pub mod settings;

mod buffer;


pub use base::OpCode;
pub use connection::{is_valid_close_code, Connection};
pub use handshake::Upgrader;
pub use runtime::{Executor, Runtime, Session, Transport};
pub use settings::Settings;

/// A type-erased error.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The result of one decoding step over a growing byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsing<T> {
    /// A complete value was parsed out of the first `offset` bytes.
    Done {
        /// The parsed value.
        value: T,
        /// Bytes consumed from the input.
        offset: usize
    },
    /// The buffer does not hold a complete value yet; nothing was
    /// consumed.
    NeedMore
}
