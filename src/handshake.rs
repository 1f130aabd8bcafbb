// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! The server side of the websocket [handshake].
//!
//! The HTTP request has already been parsed by the host; the [`Upgrader`]
//! validates it, negotiates subprotocol and compression, hijacks the raw
//! transport out of the HTTP session and writes the `101 Switching
//! Protocols` response, yielding a [`Connection`] that takes over the
//! byte stream.
//!
//! [handshake]: https://tools.ietf.org/html/rfc6455#section-4

use crate::connection::Connection;
use crate::http::{self, Request};
use crate::runtime::{Session, Transport};
use crate::settings::Settings;
use bytes::BytesMut;
use sha1::Sha1;
use std::{io, sync::Arc};

// Defined in RFC6455 and used to generate the `Sec-WebSocket-Accept` header
// in the server handshake response.
const KEY: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(key: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(KEY.as_bytes());
    base64::encode(&digest.digest().bytes())
}

/// Performs one websocket upgrade.
///
/// An `Upgrader` is single use; create one per upgrade request. The
/// [`Settings`] behind it may back any number of upgrades.
#[derive(Debug)]
pub struct Upgrader {
    settings: Arc<Settings>,
    used: bool
}

impl Upgrader {
    /// Create a new upgrader over shared settings.
    pub fn new(settings: Arc<Settings>) -> Self {
        Upgrader { settings, used: false }
    }

    /// Validate the upgrade request and switch protocols.
    ///
    /// `reply_headers` are additional headers the caller wants in the 101
    /// response. `Sec-WebSocket-Protocol` among them serves as a fallback
    /// protocol selection and is emitted through negotiation rather than
    /// copied; `Sec-WebSocket-Extensions` must not be present at all.
    ///
    /// On success the 101 response has been written to the hijacked
    /// transport, `on_open` has fired, and the returned [`Connection`]
    /// owns the byte stream. On failure the caller should answer with
    /// [`Upgrader::reject_response`] over the HTTP session and drop the
    /// connection.
    pub fn upgrade<S: Session>(
        &mut self,
        request: &Request<'_>,
        reply_headers: &[(&str, &str)],
        session: S
    ) -> Result<Connection<S::Transport>, Error> {
        if self.used {
            return Err(Error::Reused)
        }
        self.used = true;

        if !http::header_contains(request, "Connection", "upgrade") {
            return Err(Error::UpgradeTokenNotFound)
        }
        if !http::header_contains(request, "Upgrade", "websocket") {
            return Err(Error::UpgradeTokenNotFound)
        }
        if request.method() != "GET" {
            return Err(Error::InvalidRequestMethod)
        }
        if !http::header_contains(request, "Sec-WebSocket-Version", "13") {
            return Err(Error::InvalidWebsocketVersion)
        }
        if reply_headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(SEC_WEBSOCKET_EXTENSIONS)) {
            return Err(Error::UnsupportedExtensions)
        }
        if !(self.settings.check_origin)(request) {
            return Err(Error::OriginNotAllowed)
        }

        let key = match request.header("Sec-WebSocket-Key").map(str::trim) {
            Some(k) if !k.is_empty() => k,
            _ => return Err(Error::MissingWebsocketKey)
        };

        let protocol = self.select_protocol(request, reply_headers);

        #[cfg(feature = "deflate")]
        let compress = self.settings.enable_compression
            && http::parse_extensions(request)
                .iter()
                .any(|offer| offer.name().eq_ignore_ascii_case(crate::extension::NAME));
        #[cfg(not(feature = "deflate"))]
        let compress = false;

        let executor = session.executor();
        let runtime = session.runtime();
        let mut transport = match session.hijack() {
            Some(t) => t,
            None => return Err(Error::NotHijacker)
        };

        let response = encode_accept(key, protocol.as_deref(), compress, reply_headers);
        if let Some(timeout) = self.settings.handshake_timeout {
            transport.set_write_deadline(timeout)?
        }
        transport.write(&response)?;
        log::debug!("connection upgraded (protocol: {:?}, deflate: {})", protocol, compress);

        if let Some(on_open) = &self.settings.on_open {
            on_open()
        }

        Ok(Connection::new(transport, self.settings.clone(), runtime, executor, protocol, compress))
    }

    /// The response bytes to answer a failed upgrade with.
    pub fn reject_response(error: &Error) -> BytesMut {
        let status = error.status();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"HTTP/1.1 ");
        buf.extend_from_slice(status.as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(status.canonical_reason().unwrap_or("N/A").as_bytes());
        buf.extend_from_slice(b"\r\n\r\n");
        buf
    }

    // Pick the subprotocol to answer with.
    //
    // Server preferences take priority: the first configured protocol any
    // client offer matches wins. Without configured protocols, a protocol
    // in the caller's reply headers is echoed as is.
    fn select_protocol(&self, request: &Request<'_>, reply_headers: &[(&str, &str)]) -> Option<String> {
        if self.settings.subprotocols.is_empty() {
            return reply_headers.iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(SEC_WEBSOCKET_PROTOCOL))
                .map(|(_, v)| (*v).to_string())
        }
        for ours in &self.settings.subprotocols {
            for header in request.header_values(SEC_WEBSOCKET_PROTOCOL) {
                for part in header.split(',') {
                    let (token, _) = http::next_token(http::skip_space(part));
                    if token == ours {
                        return Some(ours.clone())
                    }
                }
            }
        }
        None
    }
}

// Encode the 101 response.
fn encode_accept(
    key: &str,
    protocol: Option<&str>,
    compress: bool,
    reply_headers: &[(&str, &str)]
) -> BytesMut {
    let mut key_buf = [0; 32];
    let accept_value = {
        let mut digest = Sha1::new();
        digest.update(key.as_bytes());
        digest.update(KEY.as_bytes());
        let d = digest.digest().bytes();
        let n = base64::encode_config_slice(&d, base64::STANDARD, &mut key_buf);
        &key_buf[.. n]
    };

    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols");
    buf.extend_from_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade");
    buf.extend_from_slice(b"\r\nSec-WebSocket-Accept: ");
    buf.extend_from_slice(accept_value);
    if let Some(p) = protocol {
        buf.extend_from_slice(b"\r\nSec-WebSocket-Protocol: ");
        buf.extend_from_slice(p.as_bytes())
    }
    if compress {
        #[cfg(feature = "deflate")]
        {
            buf.extend_from_slice(b"\r\nSec-WebSocket-Extensions: ");
            buf.extend_from_slice(crate::extension::RESPONSE_ENTRY.as_bytes())
        }
    }
    for (name, value) in reply_headers {
        if name.eq_ignore_ascii_case(SEC_WEBSOCKET_PROTOCOL) {
            continue
        }
        buf.extend_from_slice(b"\r\n");
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        // Control bytes in header values would let a caller smuggle in
        // extra response lines; blank them out.
        for b in value.bytes() {
            buf.extend_from_slice(&[if b <= 31 { b' ' } else { b }])
        }
    }
    buf.extend_from_slice(b"\r\n\r\n");
    buf
}

// Handshake error type ///////////////////////////////////////////////////////////////////////////

/// Enumeration of possible upgrade failures.
///
/// Every variant maps to the HTTP status the request should be answered
/// with (see [`Error::status`]).
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The upgrader instance has already performed an upgrade.
    #[error("upgrader instance already used")]
    Reused,

    /// `Connection: upgrade` or `Upgrade: websocket` was missing.
    #[error("connection upgrade token not found")]
    UpgradeTokenNotFound,

    /// The handshake request was not a GET request.
    #[error("handshake not a GET request")]
    InvalidRequestMethod,

    /// `Sec-WebSocket-Version` did not include 13.
    #[error("unsupported websocket version")]
    InvalidWebsocketVersion,

    /// The caller supplied `Sec-WebSocket-Extensions` reply headers.
    #[error("unsupported extensions in reply headers")]
    UnsupportedExtensions,

    /// The origin check rejected the request.
    #[error("origin not allowed")]
    OriginNotAllowed,

    /// `Sec-WebSocket-Key` was missing or empty.
    #[error("websocket key missing")]
    MissingWebsocketKey,

    /// The HTTP session cannot surrender its transport.
    #[error("session cannot be hijacked")]
    NotHijacker,

    /// Writing the handshake response failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error)
}

impl Error {
    /// The HTTP status a request failing with this error is answered with.
    pub fn status(&self) -> ::http::StatusCode {
        use ::http::StatusCode;
        match self {
            Error::UpgradeTokenNotFound
            | Error::InvalidWebsocketVersion
            | Error::MissingWebsocketKey => StatusCode::BAD_REQUEST,
            Error::InvalidRequestMethod => StatusCode::METHOD_NOT_ALLOWED,
            Error::OriginNotAllowed => StatusCode::FORBIDDEN,
            Error::Reused
            | Error::UnsupportedExtensions
            | Error::NotHijacker
            | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////
