// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! A websocket connection after the handshake phase.
//!
//! [`Connection::on_read`] is the single entry point: the transport feeds
//! it raw byte chunks of arbitrary size and boundary, and the connection
//! parses frames, reassembles messages, answers control frames and hands
//! completed messages to the user handlers through the executor.
//!
//! The transport guarantees at most one `on_read` in flight per
//! connection, so none of the state in here needs locking.

use crate::base::{self, Header, OpCode, MAX_CTRL_PAYLOAD};
use crate::buffer::{self, Buffer};
use crate::runtime::{Executor, Runtime, Transport};
use crate::settings::Settings;
use crate::Parsing;
use bytes::BytesMut;
use static_assertions::const_assert;
use std::{io, sync::Arc};

/// Longest close reason the engine itself will echo; together with the
/// two code bytes this stays within a control frame payload.
const MAX_CLOSE_REASON: usize = 123;
const_assert!(MAX_CLOSE_REASON + 2 <= MAX_CTRL_PAYLOAD as usize);

/// Is this close code legal on the wire?
///
/// Valid are the assigned codes of RFC 6455, section 7.4 (and successors)
/// plus the application range; 1004..=1006 are reserved and must not
/// appear in a close frame.
pub fn is_valid_close_code(code: u16) -> bool {
    match code {
        1000 ..= 1003 | 1007 ..= 1015 => true,
        3000 ..= 4999 => true,
        _ => false
    }
}

/// The server end of one websocket connection.
///
/// Owns the hijacked transport and all per-connection decoder state;
/// shares [`Settings`] with other connections.
pub struct Connection<T: Transport> {
    transport: T,
    settings: Arc<Settings>,
    runtime: Arc<dyn Runtime>,
    executor: Arc<dyn Executor>,
    codec: base::Codec,
    #[cfg(feature = "deflate")]
    inflater: crate::extension::Inflater,
    /// Unparsed bytes across reads.
    buffer: Buffer,
    /// Payload of the in-progress fragmented message, when a message
    /// handler is installed. `Some` implies `message_opcode` is `Some`.
    message: Option<Vec<u8>>,
    /// Summed payload length of the in-progress message. Counted for
    /// every data frame, whether or not a message buffer exists, so the
    /// size limits hold under any handler configuration.
    message_len: usize,
    /// `Text` or `Binary` while a message is in progress.
    message_opcode: Option<OpCode>,
    /// RSV1 of the first frame of the in-progress message.
    compress: bool,
    /// True between a non-fin data frame and its final continuation.
    expecting_fragments: bool,
    subprotocol: Option<String>,
    is_closed: bool
}

impl<T: Transport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl<T: Transport> Connection<T> {
    /// Create a connection over an already upgraded transport.
    ///
    /// `compress` states whether permessage-deflate was negotiated during
    /// the handshake; it licenses the RSV1 bit on incoming data frames.
    pub fn new(
        transport: T,
        settings: Arc<Settings>,
        runtime: Arc<dyn Runtime>,
        executor: Arc<dyn Executor>,
        subprotocol: Option<String>,
        compress: bool
    ) -> Self {
        let mut codec = base::Codec::new();
        if compress {
            codec.add_reserved_bits((true, false, false));
        }
        if settings.message_length_limit > 0 {
            codec.set_max_data_size(settings.message_length_limit as u64);
        }
        Connection {
            transport,
            settings,
            runtime,
            executor,
            codec,
            #[cfg(feature = "deflate")]
            inflater: crate::extension::Inflater::new(),
            buffer: Buffer::new(),
            message: None,
            message_len: 0,
            message_opcode: None,
            compress: false,
            expecting_fragments: false,
            subprotocol,
            is_closed: false
        }
    }

    /// The subprotocol selected during the handshake, if any.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Has the connection been torn down?
    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    /// Feed bytes read from the transport into the connection.
    ///
    /// The chunk may split frames at any byte boundary. Payloads are
    /// unmasked in place, which is why the chunk comes in mutable; when
    /// everything in it is consumed no copy of it is retained.
    ///
    /// At most one error is returned per call. A protocol violation
    /// answers the peer with a close frame, tears the connection down
    /// (firing `on_close`) and surfaces the error; the transport's read
    /// dispatcher needs not do anything beyond dropping the connection.
    pub fn on_read(&mut self, chunk: &mut [u8]) -> Result<(), Error> {
        if self.is_closed {
            return Err(Error::Closed)
        }

        let limit = self.settings.read_limit;
        if limit > 0 {
            let buffered = self.buffer.len();
            let incoming = buffered + chunk.len();
            let accumulated = buffered + self.message_len;
            if incoming > limit || accumulated > limit {
                let e = Error::ReadLimit {
                    buffered: std::cmp::max(incoming, accumulated),
                    maximum: limit
                };
                log::warn!("{}", e);
                self.abort(&e);
                return Err(e)
            }
        }

        let result = if self.buffer.is_empty() {
            // Fast path: parse the caller's chunk where it lies.
            match self.process(chunk) {
                Ok(consumed) => {
                    if !self.is_closed && consumed < chunk.len() {
                        let runtime = self.runtime.clone();
                        self.buffer.adopt(&chunk[consumed ..], &*runtime)
                    }
                    Ok(())
                }
                Err(e) => Err(e)
            }
        } else {
            let runtime = self.runtime.clone();
            self.buffer.push(chunk, &*runtime);
            let mut owned = self.buffer.take();
            match self.process(&mut owned) {
                Ok(consumed) => {
                    if self.is_closed {
                        runtime.free(owned)
                    } else {
                        self.buffer.retain(owned, consumed, &*runtime)
                    }
                    Ok(())
                }
                Err(e) => {
                    runtime.free(owned);
                    Err(e)
                }
            }
        };

        if let Err(e) = &result {
            self.abort(e)
        }
        result
    }

    /// Send an unsolicited pong.
    pub fn send_pong(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > MAX_CTRL_PAYLOAD as usize {
            return Err(Error::Codec(base::Error::InvalidControlFrameLen))
        }
        if self.is_closed {
            return Err(Error::Closed)
        }
        self.write_control(OpCode::Pong, data).map_err(Error::Io)
    }

    /// Close the connection: send a normal-closure close frame (best
    /// effort), release the buffers and fire `on_close`. Idempotent.
    pub fn close(&mut self) {
        if self.is_closed {
            return
        }
        let _ = self.write_control(OpCode::Close, &1000_u16.to_be_bytes());
        self.teardown(None)
    }

    // Pull complete frames off `buf` until it runs dry or the connection
    // is closed; returns how many bytes were consumed.
    fn process(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut offset = 0;
        while !self.is_closed {
            let (header, used) = match self.codec.decode(&mut buf[offset ..])? {
                Parsing::Done { value, offset: used } => (value, used),
                Parsing::NeedMore => break
            };
            let (payload_from, payload_to) = (offset + header.header_len(), offset + used);
            self.on_frame(&header, &buf[payload_from .. payload_to])?;
            offset += used
        }
        Ok(offset)
    }

    fn on_frame(&mut self, header: &Header, payload: &[u8]) -> Result<(), Error> {
        log::trace!("recv: {}", header);
        if header.opcode().is_control() {
            self.on_control(header, payload)
        } else {
            self.on_data(header, payload)
        }
    }

    // Data frames: fragmentation bookkeeping, per-frame and per-message
    // dispatch.
    fn on_data(&mut self, header: &Header, payload: &[u8]) -> Result<(), Error> {
        let opcode = header.opcode();

        if self.expecting_fragments {
            if opcode != OpCode::Continue {
                log::debug!("initial fragment while processing a fragmented message");
                return Err(Error::UnexpectedOpCode(opcode))
            }
        } else if opcode == OpCode::Continue {
            log::debug!("continue frame while not processing message fragments");
            return Err(Error::UnexpectedOpCode(OpCode::Continue))
        }

        if self.message_opcode.is_none() {
            self.message_opcode = Some(opcode);
            self.compress = header.is_rsv1()
        }

        // The size check comes before any copy or growth.
        let limit = self.settings.message_length_limit;
        if limit > 0 && self.message_len + payload.len() > limit {
            log::warn!("accumulated message length exceeds maximum");
            return Err(Error::MessageTooLarge {
                current: self.message_len + payload.len(),
                maximum: limit
            })
        }
        self.message_len += payload.len();

        if self.settings.on_data_frame.is_some() {
            if self.message_opcode == Some(OpCode::Text)
                && !self.compress
                && !self.runtime.check_utf8(payload)
            {
                log::debug!("text frame with invalid utf-8, closing");
                self.teardown(None);
                return Ok(())
            }
            let mut copy = self.runtime.malloc(payload.len());
            copy.extend_from_slice(payload);
            self.dispatch_data_frame(opcode, header.is_fin(), copy)
        }

        if self.settings.on_message.is_some() && !payload.is_empty() {
            let runtime = self.runtime.clone();
            let message = self.message.get_or_insert_with(|| runtime.malloc(payload.len()));
            buffer::append(message, payload, &*runtime)
        }

        if !header.is_fin() {
            self.expecting_fragments = true;
            return Ok(())
        }

        // Final frame: the message is complete.
        let message_opcode = self.message_opcode.take().unwrap_or(opcode);
        let compressed = self.compress;
        self.compress = false;
        self.expecting_fragments = false;
        self.message_len = 0;

        if self.settings.on_message.is_some() {
            let message = self.message.take().unwrap_or_else(|| self.runtime.malloc(0));
            let message = match self.finish_message(message, compressed)? {
                Some(m) => m,
                None => return Ok(())
            };
            if message_opcode == OpCode::Text && !self.runtime.check_utf8(&message) {
                log::debug!("text message with invalid utf-8, closing");
                self.runtime.free(message);
                self.teardown(None);
                return Ok(())
            }
            self.dispatch_message(message_opcode, message)
        }
        Ok(())
    }

    // Decompress the reassembled message if its first frame asked for it.
    #[cfg(feature = "deflate")]
    fn finish_message(&mut self, mut message: Vec<u8>, compressed: bool) -> Result<Option<Vec<u8>>, Error> {
        if !compressed {
            return Ok(Some(message))
        }
        match self.inflater.inflate(&mut message, &*self.runtime) {
            Ok(inflated) => {
                self.runtime.free(message);
                Ok(Some(inflated))
            }
            Err(e) => {
                self.runtime.free(message);
                Err(Error::Extension(Box::new(e)))
            }
        }
    }

    #[cfg(not(feature = "deflate"))]
    fn finish_message(&mut self, message: Vec<u8>, _compressed: bool) -> Result<Option<Vec<u8>>, Error> {
        // Without the deflate feature RSV1 is never licensed, so
        // `_compressed` cannot be true here.
        Ok(Some(message))
    }

    // Control frames: answer pings and closes, dispatch to handlers.
    fn on_control(&mut self, header: &Header, payload: &[u8]) -> Result<(), Error> {
        let limit = self.settings.message_length_limit;
        if limit > 0 && payload.len() > limit {
            return Err(Error::MessageTooLarge { current: payload.len(), maximum: limit })
        }
        match header.opcode() {
            OpCode::Ping => {
                if self.settings.on_ping.is_some() {
                    let mut copy = self.runtime.malloc(payload.len());
                    copy.extend_from_slice(payload);
                    self.dispatch_control(OpCode::Ping, copy)
                } else {
                    // Default: echo the payload back as a pong. The codec
                    // already rejects oversized control frames, but the
                    // default handler enforces the cap on its own.
                    if payload.len() > MAX_CTRL_PAYLOAD as usize {
                        self.teardown(None);
                        return Ok(())
                    }
                    self.write_control(OpCode::Pong, payload).map_err(Error::Io)?
                }
                Ok(())
            }
            OpCode::Pong => {
                if self.settings.on_pong.is_some() {
                    let mut copy = self.runtime.malloc(payload.len());
                    copy.extend_from_slice(payload);
                    self.dispatch_control(OpCode::Pong, copy)
                }
                Ok(())
            }
            OpCode::Close => {
                self.on_close_frame(payload);
                Ok(())
            }
            opcode => Err(Error::UnexpectedOpCode(opcode))
        }
    }

    // A close frame always tears the connection down right away; what
    // varies is the reply sent beforehand.
    fn on_close_frame(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            // Empty (or malformed one byte) close: answer in kind.
            let _ = self.write_control(OpCode::Close, &[]);
        } else {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = &payload[2 ..];
            if !is_valid_close_code(code) || !self.runtime.check_utf8(reason) {
                log::debug!("invalid close frame (code {}), answering protocol error", code);
                let _ = self.write_control(OpCode::Close, &1002_u16.to_be_bytes());
            } else if self.settings.on_close_message.is_some() {
                // The reason was just utf-8 checked.
                let text = String::from_utf8_lossy(reason).into_owned();
                self.dispatch_close_message(code, text)
            } else {
                // Default: echo code and reason, capped to a legal
                // control payload.
                let n = std::cmp::min(reason.len(), MAX_CLOSE_REASON);
                let mut reply = BytesMut::with_capacity(2 + n);
                reply.extend_from_slice(&code.to_be_bytes());
                reply.extend_from_slice(&reason[.. n]);
                let _ = self.write_control(OpCode::Close, &reply);
            }
        }
        self.teardown(None)
    }

    // Answer a fatal error with a close frame and tear down.
    fn abort(&mut self, error: &Error) {
        if self.is_closed {
            return
        }
        let code: u16 = match error {
            Error::MessageTooLarge { .. } | Error::ReadLimit { .. } => 1009,
            _ => 1002
        };
        let _ = self.write_control(OpCode::Close, &code.to_be_bytes());
        self.teardown(Some(error))
    }

    // Close the transport, release pooled buffers and fire `on_close`
    // exactly once.
    fn teardown(&mut self, error: Option<&Error>) {
        if self.is_closed {
            return
        }
        self.is_closed = true;
        self.transport.close();
        self.buffer.release(&*self.runtime);
        if let Some(m) = self.message.take() {
            self.runtime.free(m)
        }
        self.message_len = 0;
        self.message_opcode = None;
        self.compress = false;
        self.expecting_fragments = false;
        log::debug!("connection closed (error: {:?})", error.map(|e| e.to_string()));
        if let Some(on_close) = &self.settings.on_close {
            on_close(error)
        }
    }

    fn write_control(&mut self, opcode: OpCode, payload: &[u8]) -> io::Result<()> {
        debug_assert!(payload.len() <= MAX_CTRL_PAYLOAD as usize);
        let mut header = Header::new(opcode);
        header.set_payload_len(payload.len() as u64);
        let mut buf = BytesMut::with_capacity(2 + payload.len());
        base::Codec::encode_header(&header, &mut buf);
        buf.extend_from_slice(payload);
        self.transport.write(&buf)
    }

    // Handler dispatch. Submission order is delivery order per
    // connection; the executor may run the task on another thread, so
    // everything it needs is moved in.

    fn dispatch_data_frame(&self, opcode: OpCode, fin: bool, payload: Vec<u8>) {
        let settings = self.settings.clone();
        let runtime = self.runtime.clone();
        self.executor.execute(Box::new(move || {
            if let Some(handler) = &settings.on_data_frame {
                handler(opcode, fin, &payload)
            }
            if runtime.release_payload() {
                runtime.free(payload)
            }
        }))
    }

    fn dispatch_message(&self, opcode: OpCode, payload: Vec<u8>) {
        let settings = self.settings.clone();
        let runtime = self.runtime.clone();
        self.executor.execute(Box::new(move || {
            if let Some(handler) = &settings.on_message {
                handler(opcode, &payload)
            }
            if runtime.release_payload() {
                runtime.free(payload)
            }
        }))
    }

    fn dispatch_control(&self, opcode: OpCode, payload: Vec<u8>) {
        let settings = self.settings.clone();
        let runtime = self.runtime.clone();
        self.executor.execute(Box::new(move || {
            let handler = match opcode {
                OpCode::Ping => settings.on_ping.as_ref(),
                _ => settings.on_pong.as_ref()
            };
            if let Some(handler) = handler {
                handler(&payload)
            }
            if runtime.release_payload() {
                runtime.free(payload)
            }
        }))
    }

    fn dispatch_close_message(&self, code: u16, text: String) {
        let settings = self.settings.clone();
        self.executor.execute(Box::new(move || {
            if let Some(handler) = &settings.on_close_message {
                handler(code, &text)
            }
        }))
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.teardown(None)
    }
}

// Connection error type //////////////////////////////////////////////////////////////////////////

/// Errors which may occur while processing incoming frames.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An I/O error was encountered.
    #[error("i/o error: {0}")]
    Io(#[source] io::Error),

    /// The frame codec errored.
    #[error("codec error: {0}")]
    Codec(#[from] base::Error),

    /// Decompression of a message failed.
    #[error("extension error: {0}")]
    Extension(#[source] crate::BoxedError),

    /// An unexpected opcode was encountered.
    #[error("unexpected opcode: {0}")]
    UnexpectedOpCode(OpCode),

    /// The total message payload size exceeds the configured maximum.
    #[error("message too large: len >= {current}, maximum = {maximum}")]
    MessageTooLarge {
        /// Message size including the rejected frame.
        current: usize,
        /// The configured limit.
        maximum: usize
    },

    /// More bytes are buffered for this connection than allowed.
    #[error("read limit exceeded: buffered = {buffered}, maximum = {maximum}")]
    ReadLimit {
        /// Bytes that would have to be buffered.
        buffered: usize,
        /// The configured limit.
        maximum: usize
    },

    /// The connection is closed.
    #[error("connection closed")]
    Closed
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::Closed
        } else {
            Error::Io(e)
        }
    }
}

// Tests //////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::client_frame;
    use crate::runtime::mock::{MockTransport, Wire};
    use crate::runtime::{Heap, Inline};
    use assert_matches::assert_matches;
    use std::sync::{Arc, Mutex};

    const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

    fn connect(settings: Settings) -> (Connection<MockTransport>, Wire) {
        connect_with(settings, false)
    }

    fn connect_with(settings: Settings, compress: bool) -> (Connection<MockTransport>, Wire) {
        let transport = MockTransport::default();
        let wire = transport.wire.clone();
        let conn = Connection::new(
            transport,
            Arc::new(settings),
            Arc::new(Heap),
            Arc::new(Inline),
            None,
            compress
        );
        (conn, wire)
    }

    fn collecting() -> (Settings, Arc<Mutex<Vec<(OpCode, Vec<u8>)>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let mut settings = Settings::new();
        settings.on_message(move |opcode, data| {
            sink.lock().unwrap().push((opcode, data.to_vec()));
        });
        (settings, messages)
    }

    #[test]
    fn text_message_is_delivered() {
        let (settings, messages) = collecting();
        let (mut conn, _) = connect(settings);
        conn.on_read(&mut client_frame(true, false, OpCode::Text, MASK, b"Hello")).unwrap();
        assert_eq!(*messages.lock().unwrap(), vec![(OpCode::Text, b"Hello".to_vec())]);
    }

    #[test]
    fn lone_continuation_is_a_protocol_error() {
        let (settings, _) = collecting();
        let (mut conn, wire) = connect(settings);
        let err = conn
            .on_read(&mut client_frame(true, false, OpCode::Continue, MASK, b"x"))
            .unwrap_err();
        assert_matches!(err, Error::UnexpectedOpCode(OpCode::Continue));
        assert!(wire.is_closed());
        // The peer was told why: close frame, code 1002.
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xEA])
    }

    #[test]
    fn data_opcode_during_fragmentation_is_a_protocol_error() {
        let (settings, _) = collecting();
        let (mut conn, _) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Text, MASK, b"He")).unwrap();
        let err = conn
            .on_read(&mut client_frame(true, false, OpCode::Binary, MASK, b"x"))
            .unwrap_err();
        assert_matches!(err, Error::UnexpectedOpCode(OpCode::Binary))
    }

    #[test]
    fn reserved_bit_fails_without_negotiation() {
        let (settings, messages) = collecting();
        let (mut conn, wire) = connect(settings);
        let err = conn
            .on_read(&mut client_frame(true, true, OpCode::Text, MASK, b"x"))
            .unwrap_err();
        assert_matches!(err, Error::Codec(base::Error::InvalidReservedBit(1)));
        assert!(wire.is_closed());
        assert!(messages.lock().unwrap().is_empty())
    }

    #[test]
    fn message_limit_enforced_across_fragments() {
        let (mut settings, _) = collecting();
        settings.set_message_length_limit(8);
        let (mut conn, wire) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Binary, MASK, b"12345")).unwrap();
        let err = conn
            .on_read(&mut client_frame(true, false, OpCode::Continue, MASK, b"6789"))
            .unwrap_err();
        assert_matches!(err, Error::MessageTooLarge { current: 9, maximum: 8 });
        // Too-big errors answer with 1009.
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xF1]);
        assert!(wire.is_closed())
    }

    #[test]
    fn read_limit_enforced() {
        let mut settings = Settings::new();
        settings.set_read_limit(4);
        let (mut conn, _) = connect(settings);
        let err = conn
            .on_read(&mut client_frame(true, false, OpCode::Binary, MASK, b"123456"))
            .unwrap_err();
        assert_matches!(err, Error::ReadLimit { maximum: 4, .. })
    }

    #[test]
    fn default_ping_echoes_pong() {
        let (mut conn, wire) = connect(Settings::new());
        conn.on_read(&mut client_frame(true, false, OpCode::Ping, MASK, b"p")).unwrap();
        assert_eq!(wire.written(), vec![0x8A, 0x01, b'p']);
        assert!(!wire.is_closed())
    }

    #[test]
    fn ping_handler_replaces_echo() {
        let pings = Arc::new(Mutex::new(Vec::new()));
        let sink = pings.clone();
        let mut settings = Settings::new();
        settings.on_ping(move |data| sink.lock().unwrap().push(data.to_vec()));
        let (mut conn, wire) = connect(settings);
        conn.on_read(&mut client_frame(true, false, OpCode::Ping, MASK, b"hi")).unwrap();
        assert_eq!(*pings.lock().unwrap(), vec![b"hi".to_vec()]);
        assert!(wire.written().is_empty())
    }

    #[test]
    fn default_pong_is_a_no_op() {
        let (mut conn, wire) = connect(Settings::new());
        conn.on_read(&mut client_frame(true, false, OpCode::Pong, MASK, b"late")).unwrap();
        assert!(wire.written().is_empty());
        assert!(!wire.is_closed())
    }

    #[test]
    fn invalid_close_code_answers_protocol_error() {
        let (mut conn, wire) = connect(Settings::new());
        let payload = 1004_u16.to_be_bytes();
        conn.on_read(&mut client_frame(true, false, OpCode::Close, MASK, &payload)).unwrap();
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xEA]);
        assert!(wire.is_closed())
    }

    #[test]
    fn close_with_invalid_utf8_reason_answers_protocol_error() {
        let (mut conn, wire) = connect(Settings::new());
        let mut payload = 1000_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&[0xFF, 0xFE]);
        conn.on_read(&mut client_frame(true, false, OpCode::Close, MASK, &payload)).unwrap();
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xEA])
    }

    #[test]
    fn close_echo_and_teardown() {
        let closed = Arc::new(Mutex::new(0));
        let n = closed.clone();
        let mut settings = Settings::new();
        settings.on_close(move |_| *n.lock().unwrap() += 1);
        let (mut conn, wire) = connect(settings);

        let mut payload = 1000_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        conn.on_read(&mut client_frame(true, false, OpCode::Close, MASK, &payload)).unwrap();

        let mut expected = vec![0x88, 0x05, 0x03, 0xE8];
        expected.extend_from_slice(b"bye");
        assert_eq!(wire.written(), expected);
        assert!(wire.is_closed());
        assert_eq!(*closed.lock().unwrap(), 1);

        // Everything after the close is refused; on_close stays at one.
        assert_matches!(
            conn.on_read(&mut client_frame(true, false, OpCode::Text, MASK, b"x")),
            Err(Error::Closed)
        );
        assert_eq!(*closed.lock().unwrap(), 1);
    }

    #[test]
    fn close_message_handler_sees_code_and_reason() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut settings = Settings::new();
        settings.on_close_message(move |code, text| {
            *sink.lock().unwrap() = Some((code, text.to_string()));
        });
        let (mut conn, wire) = connect(settings);
        let mut payload = 3001_u16.to_be_bytes().to_vec();
        payload.extend_from_slice("góðan dag".as_bytes());
        conn.on_read(&mut client_frame(true, false, OpCode::Close, MASK, &payload)).unwrap();
        assert_eq!(seen.lock().unwrap().take(), Some((3001, "góðan dag".to_string())));
        // The handler took over the reply; the connection is still torn down.
        assert!(wire.written().is_empty());
        assert!(wire.is_closed())
    }

    #[test]
    fn short_close_answers_empty_close() {
        for payload in [&b""[..], &b"\x03"[..]].iter() {
            let (mut conn, wire) = connect(Settings::new());
            conn.on_read(&mut client_frame(true, false, OpCode::Close, MASK, payload)).unwrap();
            assert_eq!(wire.written(), vec![0x88, 0x00]);
            assert!(wire.is_closed())
        }
    }

    #[test]
    fn invalid_utf8_text_closes_without_error() {
        let (settings, messages) = collecting();
        let (mut conn, wire) = connect(settings);
        let result = conn.on_read(&mut client_frame(true, false, OpCode::Text, MASK, &[0xC3, 0x28]));
        assert!(result.is_ok());
        assert!(wire.is_closed());
        assert!(messages.lock().unwrap().is_empty());
        // No close frame either; the transport is just torn down.
        assert!(wire.written().is_empty())
    }

    #[test]
    fn data_frame_handler_sees_fragments() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let mut settings = Settings::new();
        settings.on_data_frame(move |opcode, fin, data| {
            sink.lock().unwrap().push((opcode, fin, data.to_vec()));
        });
        let (mut conn, _) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Text, MASK, b"He")).unwrap();
        conn.on_read(&mut client_frame(true, false, OpCode::Continue, MASK, b"llo")).unwrap();
        assert_eq!(*frames.lock().unwrap(), vec![
            (OpCode::Text, false, b"He".to_vec()),
            (OpCode::Continue, true, b"llo".to_vec())
        ]);
    }

    #[test]
    fn no_message_handler_means_no_accumulation() {
        let mut settings = Settings::new();
        settings.on_data_frame(|_, _, _| ());
        let (mut conn, _) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Binary, MASK, b"abc")).unwrap();
        assert!(conn.message.is_none());
        assert_eq!(conn.message_len, 3);
        assert!(conn.expecting_fragments);
        conn.on_read(&mut client_frame(true, false, OpCode::Continue, MASK, b"def")).unwrap();
        assert!(!conn.expecting_fragments);
        assert_eq!(conn.message_len, 0);
        assert_eq!(conn.message_opcode, None)
    }

    #[test]
    fn message_limit_holds_without_message_handler() {
        // Only a per-frame handler installed: no message buffer exists,
        // yet the summed fragment lengths still bound the message.
        let mut settings = Settings::new();
        settings.on_data_frame(|_, _, _| ());
        settings.set_message_length_limit(8);
        let (mut conn, wire) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Binary, MASK, b"12345")).unwrap();
        let err = conn
            .on_read(&mut client_frame(false, false, OpCode::Continue, MASK, b"6789"))
            .unwrap_err();
        assert_matches!(err, Error::MessageTooLarge { current: 9, maximum: 8 });
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xF1]);
        assert!(wire.is_closed())
    }

    #[test]
    fn read_limit_counts_fragments_without_message_handler() {
        let mut settings = Settings::new();
        settings.on_data_frame(|_, _, _| ());
        settings.set_read_limit(16);
        let (mut conn, _) = connect(settings);
        conn.on_read(&mut client_frame(false, false, OpCode::Binary, MASK, &[0; 10])).unwrap();
        conn.on_read(&mut client_frame(false, false, OpCode::Continue, MASK, &[0; 10])).unwrap();
        // 20 fragment bytes are pending now; the next read trips the
        // accumulation limit no matter how small it is.
        let err = conn
            .on_read(&mut client_frame(false, false, OpCode::Continue, MASK, &[0; 1]))
            .unwrap_err();
        assert_matches!(err, Error::ReadLimit { maximum: 16, .. })
    }

    #[test]
    fn local_close_sends_normal_closure() {
        let (mut conn, wire) = connect(Settings::new());
        conn.close();
        conn.close();
        assert_eq!(wire.written(), vec![0x88, 0x02, 0x03, 0xE8]);
        assert!(wire.is_closed())
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn compressed_message_is_inflated() {
        let (mut settings, messages) = collecting();
        settings.set_enable_compression(true);
        let (mut conn, _) = connect_with(settings, true);
        let compressed = crate::extension::deflate_message(b"Hello compression");
        let mut frame = client_frame(true, true, OpCode::Text, MASK, &compressed);
        conn.on_read(&mut frame).unwrap();
        assert_eq!(*messages.lock().unwrap(), vec![(OpCode::Text, b"Hello compression".to_vec())]);
    }

    #[cfg(feature = "deflate")]
    #[test]
    fn corrupt_compressed_message_errors() {
        let (settings, _) = collecting();
        let (mut conn, wire) = connect_with(settings, true);
        let err = conn
            .on_read(&mut client_frame(true, true, OpCode::Binary, MASK, &[0xFE, 0xFF, 0x13]))
            .unwrap_err();
        assert_matches!(err, Error::Extension(_));
        assert!(wire.is_closed())
    }

    #[test]
    fn valid_close_codes() {
        for code in [1000_u16, 1001, 1003, 1007, 1011, 1012, 1015, 3000, 4999].iter() {
            assert!(is_valid_close_code(*code), "{} should be valid", code)
        }
        for code in [999_u16, 1004, 1005, 1006, 1016, 2999, 5000].iter() {
            assert!(!is_valid_close_code(*code), "{} should be invalid", code)
        }
    }
}
