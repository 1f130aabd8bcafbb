// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Connection policies and the user handler registry.
//!
//! One [`Settings`] value is built once, wrapped in an [`Arc`] and shared
//! by any number of connections; nothing in here is mutated after the
//! first connection uses it.

use crate::base::OpCode;
use crate::connection;
use crate::http::{self, Request};
use std::{fmt, time::Duration};

pub(crate) type OpenHandler = Box<dyn Fn() + Send + Sync>;
pub(crate) type MessageHandler = Box<dyn Fn(OpCode, &[u8]) + Send + Sync>;
pub(crate) type DataFrameHandler = Box<dyn Fn(OpCode, bool, &[u8]) + Send + Sync>;
pub(crate) type ControlHandler = Box<dyn Fn(&[u8]) + Send + Sync>;
pub(crate) type CloseHandler = Box<dyn Fn(Option<&connection::Error>) + Send + Sync>;
pub(crate) type CloseMessageHandler = Box<dyn Fn(u16, &str) + Send + Sync>;
pub(crate) type OriginCheck = Box<dyn Fn(&Request<'_>) -> bool + Send + Sync>;

/// Shared, read-mostly configuration backing one or many connections.
pub struct Settings {
    pub(crate) read_limit: usize,
    pub(crate) message_length_limit: usize,
    pub(crate) handshake_timeout: Option<Duration>,
    pub(crate) enable_compression: bool,
    pub(crate) enable_write_compression: bool,
    pub(crate) compression_level: u32,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) check_origin: OriginCheck,
    pub(crate) on_open: Option<OpenHandler>,
    pub(crate) on_message: Option<MessageHandler>,
    pub(crate) on_data_frame: Option<DataFrameHandler>,
    pub(crate) on_close: Option<CloseHandler>,
    pub(crate) on_ping: Option<ControlHandler>,
    pub(crate) on_pong: Option<ControlHandler>,
    pub(crate) on_close_message: Option<CloseMessageHandler>
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            read_limit: 0,
            message_length_limit: 256 * 1024 * 1024,
            handshake_timeout: None,
            enable_compression: false,
            enable_write_compression: false,
            compression_level: 1,
            subprotocols: Vec::new(),
            check_origin: Box::new(default_check_origin),
            on_open: None,
            on_message: None,
            on_data_frame: None,
            on_close: None,
            on_ping: None,
            on_pong: None,
            on_close_message: None
        }
    }
}

impl Settings {
    /// Create settings with default limits and no handlers.
    pub fn new() -> Self {
        Settings::default()
    }

    /// Limit the bytes buffered for one connection across reads.
    ///
    /// 0 disables the limit.
    pub fn set_read_limit(&mut self, limit: usize) -> &mut Self {
        self.read_limit = limit;
        self
    }

    /// Set the maximum size of a complete message.
    ///
    /// Message fragments will be buffered and concatenated up to this
    /// value, i.e. the sum of all message frames payload lengths will not
    /// be greater than this maximum. Decompression may increase the total
    /// size further.
    pub fn set_message_length_limit(&mut self, limit: usize) -> &mut Self {
        self.message_length_limit = limit;
        self
    }

    /// Set a deadline for writing the handshake response.
    pub fn set_handshake_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Accept the permessage-deflate extension when clients offer it.
    pub fn set_enable_compression(&mut self, enable: bool) -> &mut Self {
        self.enable_compression = enable;
        self
    }

    /// Compress outgoing messages (consumed by the write path).
    pub fn set_enable_write_compression(&mut self, enable: bool) -> &mut Self {
        self.enable_write_compression = enable;
        self
    }

    /// Compression level for outgoing messages (consumed by the write path).
    pub fn set_compression_level(&mut self, level: u32) -> &mut Self {
        self.compression_level = level;
        self
    }

    /// Add a subprotocol the server supports, in preference order.
    pub fn add_subprotocol(&mut self, proto: impl Into<String>) -> &mut Self {
        self.subprotocols.push(proto.into());
        self
    }

    /// Replace the origin check.
    ///
    /// The default accepts requests without an `Origin` header and
    /// otherwise requires the origin authority to equal the `Host`
    /// header (ASCII case-insensitive).
    pub fn set_check_origin<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&Request<'_>) -> bool + Send + Sync + 'static
    {
        self.check_origin = Box::new(f);
        self
    }

    /// Called once the handshake response has been written.
    pub fn on_open<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() + Send + Sync + 'static
    {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Called with every complete (reassembled) text or binary message.
    pub fn on_message<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(OpCode, &[u8]) + Send + Sync + 'static
    {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Called with every data frame as it arrives, before reassembly.
    ///
    /// The arguments are the frame opcode, the fin flag and the frame
    /// payload. Installing this handler costs one payload copy per frame.
    pub fn on_data_frame<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(OpCode, bool, &[u8]) + Send + Sync + 'static
    {
        self.on_data_frame = Some(Box::new(f));
        self
    }

    /// Called exactly once when the connection goes away.
    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Option<&connection::Error>) + Send + Sync + 'static
    {
        self.on_close = Some(Box::new(f));
        self
    }

    /// Called with the payload of every ping frame.
    ///
    /// Replaces the default pong echo.
    pub fn on_ping<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static
    {
        self.on_ping = Some(Box::new(f));
        self
    }

    /// Called with the payload of every pong frame.
    pub fn on_pong<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&[u8]) + Send + Sync + 'static
    {
        self.on_pong = Some(Box::new(f));
        self
    }

    /// Called with the validated code and reason of a close frame.
    ///
    /// Replaces the default close echo; the close reply (if any) becomes
    /// the handler's business, the transport is torn down regardless.
    pub fn on_close_message<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(u16, &str) + Send + Sync + 'static
    {
        self.on_close_message = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Settings")
            .field("read_limit", &self.read_limit)
            .field("message_length_limit", &self.message_length_limit)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("enable_compression", &self.enable_compression)
            .field("enable_write_compression", &self.enable_write_compression)
            .field("compression_level", &self.compression_level)
            .field("subprotocols", &self.subprotocols)
            .finish()
    }
}

/// The default origin policy.
///
/// Absence of an `Origin` header is fine (non-browser clients); anything
/// else must name the authority the request was sent to.
pub fn default_check_origin(request: &Request<'_>) -> bool {
    let origin = match request.header("Origin") {
        Some(o) => o,
        None => return true
    };
    let authority = match http::authority(origin) {
        Some(a) => a,
        None => return false
    };
    match request.host() {
        Some(host) => authority.eq_ignore_ascii_case(host),
        None => false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(headers: &'a [httparse::Header<'a>]) -> Request<'a> {
        Request::new("GET", "/", headers)
    }

    #[test]
    fn origin_absent_is_allowed() {
        let headers = [httparse::Header { name: "Host", value: b"example.com" }];
        assert!(default_check_origin(&request(&headers)))
    }

    #[test]
    fn origin_must_match_host() {
        let ok = [
            httparse::Header { name: "Host", value: b"Example.com:80" },
            httparse::Header { name: "Origin", value: b"http://example.COM:80" }
        ];
        assert!(default_check_origin(&request(&ok)));

        let cross = [
            httparse::Header { name: "Host", value: b"example.com" },
            httparse::Header { name: "Origin", value: b"http://evil.example" }
        ];
        assert!(!default_check_origin(&request(&cross)));

        let garbled = [
            httparse::Header { name: "Host", value: b"example.com" },
            httparse::Header { name: "Origin", value: b"not a url" }
        ];
        assert!(!default_check_origin(&request(&garbled)))
    }
}
