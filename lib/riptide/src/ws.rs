use crate::conn::{Connection, Proto};
use crate::http::HttpMessage;
use byteorder::{BigEndian, ByteOrder};
use keel::{ErrorKind, NetError, NetResult};
use sha1::{Digest, Sha1};
use std::str;

pub const WS_OP_CONTINUATION: u8 = 0x0;
pub const WS_OP_TEXT: u8 = 0x1;
pub const WS_OP_BINARY: u8 = 0x2;
pub const WS_OP_CLOSE: u8 = 0x8;
pub const WS_OP_PING: u8 = 0x9;
pub const WS_OP_PONG: u8 = 0xa;

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;

/// Fixed GUID from RFC 6455 used to derive the accept key.
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// One WebSocket message as delivered to the handler: payload plus the
/// first header byte (FIN, RSV bits, opcode). Valid only during dispatch.
pub struct WsFrame<'a> {
    pub flags: u8,
    payload: &'a [u8],
}

impl<'a> WsFrame<'a> {
    pub(crate) fn new(flags: u8, payload: &'a [u8]) -> WsFrame<'a> {
        WsFrame { flags, payload }
    }

    #[inline]
    pub fn opcode(&self) -> u8 {
        self.flags & 0x0f
    }

    #[inline]
    pub fn fin(&self) -> bool {
        self.flags & FIN_BIT != 0
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Payload as text; empty on invalid UTF-8.
    #[inline]
    pub fn text(&self) -> &str {
        str::from_utf8(self.payload).unwrap_or("")
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(WS_MAGIC_GUID.as_bytes());
    base64::encode(&sha.finalize()[..])
}

/// Random client nonce for the `Sec-WebSocket-Key` header.
pub(crate) fn client_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::encode(&nonce)
}

/// Outcome of scanning the recv buffer for one frame.
pub(crate) enum WsProgress {
    NeedMore,
    Frame {
        raw_len: usize,
        flags: u8,
        payload: Vec<u8>,
    },
}

/// Parses one frame header + payload, unmasking in place. `max_frame`
/// bounds the payload length; larger frames are a parse error.
pub(crate) fn next_frame(buf: &[u8], max_frame: usize) -> NetResult<WsProgress> {
    if buf.len() < 2 {
        return Ok(WsProgress::NeedMore);
    }

    let flags = buf[0];
    let opcode = flags & 0x0f;
    let masked = buf[1] & MASK_BIT != 0;
    let len7 = (buf[1] & 0x7f) as usize;

    let (len, mut cursor) = match len7 {
        126 => {
            if buf.len() < 4 {
                return Ok(WsProgress::NeedMore);
            }
            (BigEndian::read_u16(&buf[2..4]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(WsProgress::NeedMore);
            }
            let wide = BigEndian::read_u64(&buf[2..10]);
            if wide > max_frame as u64 {
                return Err(NetError::Fatal(ErrorKind::Parse("frame exceeds size cap")));
            }
            (wide as usize, 10)
        }
        _ => (len7, 2),
    };

    if len > max_frame {
        return Err(NetError::Fatal(ErrorKind::Parse("frame exceeds size cap")));
    }

    if opcode >= WS_OP_CLOSE && (len > 125 || flags & FIN_BIT == 0) {
        return Err(NetError::Fatal(ErrorKind::Parse("malformed control frame")));
    }

    let mask = if masked {
        if buf.len() < cursor + 4 {
            return Ok(WsProgress::NeedMore);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[cursor..cursor + 4]);
        cursor += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < cursor + len {
        return Ok(WsProgress::NeedMore);
    }

    let mut payload = buf[cursor..cursor + len].to_vec();
    if let Some(key) = mask {
        for (index, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[index % 4];
        }
    }

    Ok(WsProgress::Frame {
        raw_len: cursor + len,
        flags,
        payload,
    })
}

/// Serializes a frame header + payload. Client-originated frames are
/// masked per RFC 6455; server frames are sent in the clear.
pub(crate) fn encode_frame(opcode: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(FIN_BIT | (opcode & 0x0f));

    let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
    if payload.len() < 126 {
        frame.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        frame.push(mask_bit | 126);
        let mut len = [0u8; 2];
        BigEndian::write_u16(&mut len, payload.len() as u16);
        frame.extend_from_slice(&len);
    } else {
        frame.push(mask_bit | 127);
        let mut len = [0u8; 8];
        BigEndian::write_u64(&mut len, payload.len() as u64);
        frame.extend_from_slice(&len);
    }

    match mask {
        Some(key) => {
            frame.extend_from_slice(&key);
            frame.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        }
        None => frame.extend_from_slice(payload),
    }

    frame
}

/// A fully assembled message ready for dispatch.
pub(crate) enum WsDeliver {
    /// Data frame (fragments already joined).
    Data { flags: u8, payload: Vec<u8> },
    /// Control frame, passed through as-is.
    Ctl { flags: u8, payload: Vec<u8> },
    /// Mid-fragment; nothing to deliver yet.
    Pending,
}

/// Folds an incoming frame into the connection's fragment accumulator.
/// Control frames pass through untouched (they may interleave with
/// fragments); data fragments are joined until FIN.
pub(crate) fn assemble(conn: &mut Connection, flags: u8, payload: Vec<u8>) -> NetResult<WsDeliver> {
    let opcode = flags & 0x0f;
    let fin = flags & FIN_BIT != 0;

    if opcode >= WS_OP_CLOSE {
        return Ok(WsDeliver::Ctl { flags, payload });
    }

    match (opcode, conn.ws_frag_opcode) {
        // Unfragmented frame with no join in progress.
        (WS_OP_TEXT, None) | (WS_OP_BINARY, None) if fin => {
            Ok(WsDeliver::Data { flags, payload })
        }
        // First fragment.
        (WS_OP_TEXT, None) | (WS_OP_BINARY, None) => {
            conn.ws_frag_opcode = Some(opcode);
            conn.ws_frag = payload;
            Ok(WsDeliver::Pending)
        }
        // Continuation of a join in progress.
        (WS_OP_CONTINUATION, Some(first_opcode)) => {
            conn.ws_frag.extend_from_slice(&payload);

            if !fin {
                return Ok(WsDeliver::Pending);
            }

            conn.ws_frag_opcode = None;
            Ok(WsDeliver::Data {
                flags: FIN_BIT | first_opcode,
                payload: std::mem::take(&mut conn.ws_frag),
            })
        }
        _ => Err(NetError::Fatal(ErrorKind::Parse("bad fragmentation sequence"))),
    }
}

impl Connection {
    /// Completes a server-side upgrade while handling the HTTP_MSG that
    /// requested it: writes the 101 response, switches the connection to
    /// WebSocket framing, and arranges the WS_OPEN dispatch.
    pub fn ws_upgrade(
        &mut self,
        msg: &HttpMessage<'_>,
        extra_headers: &[(&str, &str)],
    ) -> NetResult<()> {
        let key = match msg.header("Sec-WebSocket-Key") {
            Some(key) => key.trim().to_owned(),
            None => {
                self.reply(400, &[], b"missing Sec-WebSocket-Key")?;
                self.drain();
                return Err(NetError::Fatal(ErrorKind::Parse("upgrade without key")));
            }
        };

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            accept_key(&key)
        );

        for (name, value) in extra_headers {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
        response.push_str("\r\n");

        self.send_bytes(response.as_bytes())?;

        self.proto = Proto::Ws;
        self.websocket = true;
        self.hdrs_emitted = false;
        self.ws_open_pending = true;

        Ok(())
    }

    /// Sends one WebSocket frame. The `client` flag selects masking per
    /// the RFC: client-originated connections mask, servers do not.
    pub fn ws_send(&mut self, payload: &[u8], opcode: u8) -> NetResult<()> {
        if !self.websocket {
            return Err(NetError::Fatal(ErrorKind::Usage("connection is not websocket")));
        }

        let mask = if self.client {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };

        let frame = encode_frame(opcode, payload, mask);
        self.send_bytes(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel::logging;

    fn ws_conn() -> Connection {
        let mut conn = Connection::virtual_endpoint(1, Proto::Ws, logging::discard());
        conn.websocket = true;
        conn
    }

    #[test]
    fn test_accept_key_rfc_sample() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_masked_text_frame_decodes() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let frame = encode_frame(WS_OP_TEXT, b"ping", Some(key));

        match next_frame(&frame, 1 << 20).unwrap() {
            WsProgress::Frame {
                raw_len,
                flags,
                payload,
            } => {
                assert_eq!(raw_len, frame.len());
                assert_eq!(flags & 0x0f, WS_OP_TEXT);
                assert_eq!(payload, b"ping");
            }
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_unmasked_frame_roundtrip_16bit_length() {
        let payload = vec![7u8; 300];
        let frame = encode_frame(WS_OP_BINARY, &payload, None);

        // 2 header bytes + 2 extended length bytes.
        assert_eq!(frame.len(), 4 + payload.len());

        match next_frame(&frame, 1 << 20).unwrap() {
            WsProgress::Frame { payload: decoded, .. } => assert_eq!(decoded, payload),
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_64bit_length_roundtrip() {
        let payload = vec![1u8; 70_000];
        let frame = encode_frame(WS_OP_BINARY, &payload, None);

        assert_eq!(frame[1] & 0x7f, 127);
        match next_frame(&frame, 1 << 20).unwrap() {
            WsProgress::Frame { payload: decoded, .. } => assert_eq!(decoded.len(), 70_000),
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn test_partial_frame_needs_more() {
        let frame = encode_frame(WS_OP_TEXT, b"hello", None);

        for cut in 0..frame.len() {
            match next_frame(&frame[..cut], 1 << 20).unwrap() {
                WsProgress::NeedMore => (),
                _ => panic!("truncated frame at {} must not decode", cut),
            }
        }
    }

    #[test]
    fn test_frame_size_cap() {
        let frame = encode_frame(WS_OP_BINARY, &vec![0u8; 2048], None);
        assert!(next_frame(&frame, 1024).is_err());
    }

    #[test]
    fn test_oversized_control_frame_rejected() {
        let frame = encode_frame(WS_OP_PING, &vec![0u8; 200], None);
        assert!(next_frame(&frame, 1 << 20).is_err());
    }

    #[test]
    fn test_fragments_join_before_delivery() {
        let mut conn = ws_conn();

        // First fragment: TEXT without FIN.
        let first = assemble(&mut conn, WS_OP_TEXT, b"hel".to_vec()).unwrap();
        assert!(matches!(first, WsDeliver::Pending));

        // Interleaved control frame passes through.
        let ping = assemble(&mut conn, FIN_BIT | WS_OP_PING, b"hb".to_vec()).unwrap();
        assert!(matches!(ping, WsDeliver::Ctl { .. }));

        let middle = assemble(&mut conn, WS_OP_CONTINUATION, b"lo ".to_vec()).unwrap();
        assert!(matches!(middle, WsDeliver::Pending));

        match assemble(&mut conn, FIN_BIT | WS_OP_CONTINUATION, b"world".to_vec()).unwrap() {
            WsDeliver::Data { flags, payload } => {
                assert_eq!(flags, FIN_BIT | WS_OP_TEXT);
                assert_eq!(payload, b"hello world");
            }
            _ => panic!("expected joined message"),
        }
    }

    #[test]
    fn test_stray_continuation_is_parse_error() {
        let mut conn = ws_conn();
        assert!(assemble(&mut conn, FIN_BIT | WS_OP_CONTINUATION, b"x".to_vec()).is_err());
    }

    #[test]
    fn test_upgrade_writes_accept_and_flips_protocol() {
        let raw = b"GET /chat HTTP/1.1\r\n\
                    Host: x\r\n\
                    Upgrade: websocket\r\n\
                    Connection: Upgrade\r\n\
                    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                    Sec-WebSocket-Version: 13\r\n\r\n";
        let msg = crate::http::parse::view(raw, 0);

        let mut conn = Connection::virtual_endpoint(1, Proto::Http, logging::discard());
        conn.ws_upgrade(&msg, &[("X-Greeting", "hi")]).unwrap();

        let response = String::from_utf8(conn.send.read_slice().to_vec()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("X-Greeting: hi\r\n"));
        assert!(conn.websocket);
        assert!(conn.ws_open_pending);
    }

    #[test]
    fn test_upgrade_without_key_is_refused() {
        let raw = b"GET /chat HTTP/1.1\r\nHost: x\r\n\r\n";
        let msg = crate::http::parse::view(raw, 0);

        let mut conn = Connection::virtual_endpoint(1, Proto::Http, logging::discard());
        assert!(conn.ws_upgrade(&msg, &[]).is_err());
        assert!(conn.draining);
        assert!(!conn.websocket);
    }

    #[test]
    fn test_client_frames_are_masked() {
        let mut conn = ws_conn();
        conn.client = true;

        conn.ws_send(b"hello", WS_OP_TEXT).unwrap();

        let wire = conn.send.read_slice();
        assert_ne!(&wire[6..11], b"hello");
        assert_eq!(wire[1] & MASK_BIT, MASK_BIT);

        match next_frame(wire, 1 << 20).unwrap() {
            WsProgress::Frame { payload, .. } => assert_eq!(payload, b"hello"),
            _ => panic!("expected a complete frame"),
        }
    }
}
