use keel::{ErrorKind, NetError, NetResult};
use std::str;

/// Headers beyond this count are dropped silently.
pub const MAX_HEADERS: usize = 30;
/// Query-variable values are truncated to this length on extraction.
pub const MAX_QUERY_VAR: usize = 256;

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub(crate) struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[inline]
    fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    #[inline]
    fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }

    #[inline]
    fn text<'a>(&self, buf: &'a [u8]) -> &'a str {
        str::from_utf8(self.slice(buf)).unwrap_or("")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Body framing derived from the header block.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Framing {
    Length(usize),
    Chunked,
    Empty,
    /// Response without Content-Length: body runs until the peer closes.
    UntilClose,
}

/// A parsed view over one HTTP message. Purely offsets into the dispatch
/// buffer; valid only for the duration of the event callback it is passed
/// to.
pub struct HttpMessage<'a> {
    buf: &'a [u8],
    method: Span,
    uri: Span,
    query: Span,
    proto: Span,
    headers: [(Span, Span); MAX_HEADERS],
    header_count: usize,
    head_len: usize,
    body: Span,
}

impl<'a> HttpMessage<'a> {
    /// Request method (or the protocol token of a status line).
    #[inline]
    pub fn method(&self) -> &str {
        self.method.text(self.buf)
    }

    /// Request target without the query string.
    #[inline]
    pub fn uri(&self) -> &str {
        self.uri.text(self.buf)
    }

    /// Raw query string (without the leading `?`), empty if absent.
    #[inline]
    pub fn query(&self) -> &str {
        self.query.text(self.buf)
    }

    #[inline]
    pub fn proto(&self) -> &str {
        self.proto.text(self.buf)
    }

    /// Request line plus header block, including the terminating blank
    /// line.
    #[inline]
    pub fn head(&self) -> &[u8] {
        &self.buf[..self.head_len]
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        self.body.slice(self.buf)
    }

    /// The entire framed message.
    #[inline]
    pub fn message(&self) -> &[u8] {
        &self.buf[..self.body.end.max(self.head_len)]
    }

    /// First header matching `name`, case-insensitive. Duplicates are
    /// reachable in order through `headers()`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers[..self.header_count]
            .iter()
            .find(|(header, _)| header.text(self.buf).eq_ignore_ascii_case(name))
            .map(|(_, value)| value.text(self.buf))
    }

    /// All retained headers, case and order preserved.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        let buf = self.buf;
        self.headers[..self.header_count]
            .iter()
            .map(move |(name, value)| (name.text(buf), value.text(buf)))
    }

    /// Extracts and percent-decodes a query variable. Values longer than
    /// `MAX_QUERY_VAR` are truncated.
    pub fn query_var(&self, name: &str) -> Option<String> {
        let query = self.query();

        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or("");

            if key == name {
                let raw = parts.next().unwrap_or("");
                let mut decoded = percent_decode(raw.as_bytes());
                decoded.truncate(MAX_QUERY_VAR);
                return Some(decoded);
            }
        }

        None
    }

    /// Status code of a response message: the three ASCII digits following
    /// the first space of the status line.
    pub fn status(&self) -> u16 {
        let space = match self.buf.iter().position(|&byte| byte == b' ') {
            Some(pos) => pos,
            None => return 0,
        };

        let digits = &self.buf[space + 1..];
        if digits.len() < 3 || !digits[..3].iter().all(u8::is_ascii_digit) {
            return 0;
        }

        digits[..3]
            .iter()
            .fold(0u16, |acc, &digit| acc * 10 + u16::from(digit - b'0'))
    }

    /// Body framing for this message. `is_response` selects the
    /// response-side defaults.
    pub(crate) fn framing(&self, is_response: bool) -> NetResult<Framing> {
        if let Some(value) = self.header("Transfer-Encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                return Ok(Framing::Chunked);
            }
        }

        if let Some(value) = self.header("Content-Length") {
            let length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| NetError::Fatal(ErrorKind::Parse("malformed content-length")))?;
            return Ok(if length == 0 {
                Framing::Empty
            } else {
                Framing::Length(length)
            });
        }

        if is_response {
            let status = self.status();
            if status == 204 || status == 304 || (100..200).contains(&status) {
                return Ok(Framing::Empty);
            }
            return Ok(Framing::UntilClose);
        }

        Ok(Framing::Empty)
    }
}

/// Parses the request line and header block at the front of `buf`.
/// `Err(Wait)` means the head is not yet complete.
pub(crate) fn parse_head(buf: &[u8]) -> NetResult<HttpMessage<'_>> {
    let head_len = match find_subslice(buf, CRLF_CRLF) {
        Some(pos) => pos + CRLF_CRLF.len(),
        None => return Err(NetError::Wait),
    };

    let line_end = find_subslice(buf, b"\r\n").unwrap();
    let line = &buf[..line_end];

    let first_space = line
        .iter()
        .position(|&byte| byte == b' ')
        .ok_or(NetError::Fatal(ErrorKind::Parse("malformed start line")))?;
    let second_space = line[first_space + 1..]
        .iter()
        .position(|&byte| byte == b' ')
        .map(|pos| first_space + 1 + pos)
        .ok_or(NetError::Fatal(ErrorKind::Parse("malformed start line")))?;

    let method = Span::new(0, first_space);
    let target = Span::new(first_space + 1, second_space);
    let proto = Span::new(second_space + 1, line_end);

    if method.len() == 0 || target.len() == 0 {
        return Err(NetError::Fatal(ErrorKind::Parse("malformed start line")));
    }

    // Split the target into uri and query at the first '?'.
    let (uri, query) = match buf[target.start..target.end]
        .iter()
        .position(|&byte| byte == b'?')
    {
        Some(pos) => (
            Span::new(target.start, target.start + pos),
            Span::new(target.start + pos + 1, target.end),
        ),
        None => (target, Span::new(target.end, target.end)),
    };

    let mut headers = [(Span::default(), Span::default()); MAX_HEADERS];
    let mut header_count = 0;
    let mut cursor = line_end + 2;

    while cursor < head_len - 2 {
        let row_end = cursor
            + find_subslice(&buf[cursor..head_len], b"\r\n")
                .ok_or(NetError::Fatal(ErrorKind::Parse("malformed header block")))?;

        let colon = buf[cursor..row_end]
            .iter()
            .position(|&byte| byte == b':')
            .map(|pos| cursor + pos)
            .ok_or(NetError::Fatal(ErrorKind::Parse("header missing colon")))?;

        if colon == cursor {
            return Err(NetError::Fatal(ErrorKind::Parse("empty header name")));
        }

        if header_count < MAX_HEADERS {
            let mut value_start = colon + 1;
            while value_start < row_end && (buf[value_start] == b' ' || buf[value_start] == b'\t') {
                value_start += 1;
            }

            let mut value_end = row_end;
            while value_end > value_start
                && (buf[value_end - 1] == b' ' || buf[value_end - 1] == b'\t')
            {
                value_end -= 1;
            }

            headers[header_count] = (
                Span::new(cursor, colon),
                Span::new(value_start, value_end),
            );
            header_count += 1;
        }

        cursor = row_end + 2;
    }

    Ok(HttpMessage {
        buf,
        method,
        uri,
        query,
        proto,
        headers,
        header_count,
        head_len,
        body: Span::new(head_len, head_len),
    })
}

/// Binds a message view over an extracted dispatch buffer whose layout is
/// `head || body` (the body already de-chunked where applicable).
pub(crate) fn view(scratch: &[u8], body_len: usize) -> HttpMessage<'_> {
    let mut message = parse_head(scratch).expect("extracted message must re-parse");
    message.body = Span::new(message.head_len, message.head_len + body_len);
    message
}

/// Outcome of scanning the recv buffer for one complete message.
pub(crate) enum HttpProgress {
    NeedMore,
    /// A full message: `raw_len` bytes to consume from the recv buffer,
    /// and the extracted `head || body` dispatch bytes.
    Message {
        raw_len: usize,
        scratch: Vec<u8>,
        body_len: usize,
    },
}

/// Scans `buf` for one complete HTTP message, de-chunking as needed.
pub(crate) fn next_message(buf: &[u8], is_response: bool) -> NetResult<HttpProgress> {
    let head = match parse_head(buf) {
        Ok(head) => head,
        Err(NetError::Wait) => return Ok(HttpProgress::NeedMore),
        Err(err) => return Err(err),
    };

    let head_len = head.head_len;

    match head.framing(is_response)? {
        Framing::Empty => Ok(HttpProgress::Message {
            raw_len: head_len,
            scratch: buf[..head_len].to_vec(),
            body_len: 0,
        }),
        Framing::Length(length) => {
            let total = head_len + length;
            if buf.len() < total {
                return Ok(HttpProgress::NeedMore);
            }

            Ok(HttpProgress::Message {
                raw_len: total,
                scratch: buf[..total].to_vec(),
                body_len: length,
            })
        }
        Framing::Chunked => match dechunk(&buf[head_len..])? {
            None => Ok(HttpProgress::NeedMore),
            Some((raw_body_len, body)) => {
                let mut scratch = Vec::with_capacity(head_len + body.len());
                scratch.extend_from_slice(&buf[..head_len]);
                let body_len = body.len();
                scratch.extend_from_slice(&body);

                Ok(HttpProgress::Message {
                    raw_len: head_len + raw_body_len,
                    scratch,
                    body_len,
                })
            }
        },
        Framing::UntilClose => Ok(HttpProgress::NeedMore),
    }
}

/// Decodes a chunked body. Returns the raw encoded length consumed and the
/// concatenated chunk data, or `None` when the terminator chunk has not
/// arrived yet.
pub(crate) fn dechunk(buf: &[u8]) -> NetResult<Option<(usize, Vec<u8>)>> {
    let mut cursor = 0;
    let mut body = Vec::new();

    loop {
        let line_end = match find_subslice(&buf[cursor..], b"\r\n") {
            Some(pos) => cursor + pos,
            None => return Ok(None),
        };

        let mut size: usize = 0;
        let mut digits = 0;
        for &byte in &buf[cursor..line_end] {
            match (byte as char).to_digit(16) {
                Some(digit) => {
                    size = size
                        .checked_mul(16)
                        .and_then(|acc| acc.checked_add(digit as usize))
                        .ok_or(NetError::Fatal(ErrorKind::Parse("chunk size overflow")))?;
                    digits += 1;
                }
                // Chunk extensions after ';' are ignored.
                None if byte == b';' => break,
                None => return Err(NetError::Fatal(ErrorKind::Parse("malformed chunk size"))),
            }
        }

        if digits == 0 {
            return Err(NetError::Fatal(ErrorKind::Parse("malformed chunk size")));
        }

        let data_start = line_end + 2;

        if size == 0 {
            // Terminator chunk: skip optional trailers up to the final
            // blank line.
            let mut trailer = data_start;
            loop {
                let row_end = match find_subslice(&buf[trailer..], b"\r\n") {
                    Some(pos) => trailer + pos,
                    None => return Ok(None),
                };

                if row_end == trailer {
                    return Ok(Some((row_end + 2, body)));
                }

                trailer = row_end + 2;
            }
        }

        if buf.len() < data_start + size + 2 {
            return Ok(None);
        }

        if &buf[data_start + size..data_start + size + 2] != b"\r\n" {
            return Err(NetError::Fatal(ErrorKind::Parse("chunk missing terminator")));
        }

        body.extend_from_slice(&buf[data_start..data_start + size]);
        cursor = data_start + size + 2;
    }
}

fn percent_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut cursor = 0;

    while cursor < raw.len() {
        match raw[cursor] {
            b'%' => {
                let hex = |byte: u8| (byte as char).to_digit(16);

                if cursor + 2 < raw.len() {
                    if let (Some(high), Some(low)) = (hex(raw[cursor + 1]), hex(raw[cursor + 2])) {
                        out.push((high * 16 + low) as u8);
                        cursor += 3;
                        continue;
                    }
                }

                out.push(b'%');
                cursor += 1;
            }
            b'+' => {
                out.push(b' ');
                cursor += 1;
            }
            byte => {
                out.push(byte);
                cursor += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_GET: &[u8] = b"GET /hello?id=42 HTTP/1.1\r\nHost: x\r\n\r\n";

    #[test]
    fn test_parse_simple_get() {
        match next_message(SIMPLE_GET, false).unwrap() {
            HttpProgress::Message {
                raw_len,
                scratch,
                body_len,
            } => {
                assert_eq!(raw_len, SIMPLE_GET.len());
                assert_eq!(body_len, 0);

                let msg = view(&scratch, body_len);
                assert_eq!(msg.method(), "GET");
                assert_eq!(msg.uri(), "/hello");
                assert_eq!(msg.query(), "id=42");
                assert_eq!(msg.proto(), "HTTP/1.1");
                assert_eq!(msg.header("host"), Some("x"));
                assert_eq!(msg.query_var("id").as_deref(), Some("42"));
                assert_eq!(msg.query_var("nope"), None);
                assert!(msg.body().is_empty());
                assert_eq!(msg.message(), SIMPLE_GET);
            }
            _ => panic!("expected a complete message"),
        }
    }

    #[test]
    fn test_incomplete_head_needs_more() {
        match next_message(b"GET / HTTP/1.1\r\nHost: x\r\n", false).unwrap() {
            HttpProgress::NeedMore => (),
            _ => panic!("head is incomplete"),
        }
    }

    #[test]
    fn test_content_length_framing() {
        let raw = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello trailing";

        match next_message(raw, false).unwrap() {
            HttpProgress::Message {
                raw_len,
                scratch,
                body_len,
            } => {
                assert_eq!(body_len, 5);
                assert_eq!(raw_len, raw.len() - " trailing".len());
                assert_eq!(view(&scratch, body_len).body(), b"hello");
            }
            _ => panic!("expected a complete message"),
        }
    }

    #[test]
    fn test_content_length_body_pending() {
        let raw = b"POST /u HTTP/1.1\r\nHost: x\r\nContent-Length: 10\r\n\r\nhel";
        match next_message(raw, false).unwrap() {
            HttpProgress::NeedMore => (),
            _ => panic!("body is incomplete"),
        }
    }

    #[test]
    fn test_chunked_upload() {
        let raw =
            b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";

        match next_message(raw, false).unwrap() {
            HttpProgress::Message {
                raw_len,
                scratch,
                body_len,
            } => {
                assert_eq!(raw_len, raw.len());
                let msg = view(&scratch, body_len);
                assert_eq!(msg.body(), b"hello world");
                assert_eq!(msg.body().len(), 11);
            }
            _ => panic!("expected a complete message"),
        }
    }

    #[test]
    fn test_chunked_waits_for_terminator() {
        let raw = b"POST /u HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n";
        match next_message(raw, false).unwrap() {
            HttpProgress::NeedMore => (),
            _ => panic!("terminator chunk missing"),
        }
    }

    #[test]
    fn test_chunk_size_with_extension() {
        let (_, body) = dechunk(b"5;ext=1\r\nhello\r\n0\r\n\r\n").unwrap().unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_malformed_chunk_size() {
        assert!(dechunk(b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn test_header_lookup_first_match_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\n\r\n";
        let msg = parse_head(raw).unwrap();

        assert_eq!(msg.header("X-TAG"), Some("one"));

        let tags: Vec<_> = msg
            .headers()
            .filter(|(name, _)| name.eq_ignore_ascii_case("x-tag"))
            .map(|(_, value)| value)
            .collect();
        assert_eq!(tags, vec!["one", "two"]);
    }

    #[test]
    fn test_headers_beyond_max_dropped() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for index in 0..MAX_HEADERS + 5 {
            raw.extend_from_slice(format!("H{}: {}\r\n", index, index).as_bytes());
        }
        raw.extend_from_slice(b"\r\n");

        let msg = parse_head(&raw).unwrap();
        assert_eq!(msg.headers().count(), MAX_HEADERS);
        assert_eq!(msg.header("H0"), Some("0"));
        assert_eq!(msg.header("H29"), Some("29"));
        assert_eq!(msg.header("H30"), None);
    }

    #[test]
    fn test_query_var_truncation() {
        let mut raw = b"GET /p?v=".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_QUERY_VAR + 50));
        raw.extend_from_slice(b" HTTP/1.1\r\nHost: x\r\n\r\n");

        let msg = parse_head(&raw).unwrap();
        assert_eq!(msg.query_var("v").unwrap().len(), MAX_QUERY_VAR);
    }

    #[test]
    fn test_query_var_percent_decode() {
        let raw = b"GET /p?msg=hello%20world+again%2B HTTP/1.1\r\n\r\n";
        let msg = parse_head(raw).unwrap();
        assert_eq!(msg.query_var("msg").as_deref(), Some("hello world again+"));
    }

    #[test]
    fn test_response_status_extraction() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let msg = parse_head(raw).unwrap();
        assert_eq!(msg.status(), 404);
        assert_eq!(msg.framing(true).unwrap(), Framing::Empty);
    }

    #[test]
    fn test_response_until_close_framing() {
        let raw = b"HTTP/1.1 200 OK\r\nServer: r\r\n\r\n";
        let msg = parse_head(raw).unwrap();
        assert_eq!(msg.framing(true).unwrap(), Framing::UntilClose);
    }

    #[test]
    fn test_malformed_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: banana\r\n\r\n";
        assert!(next_message(raw, false).is_err());
    }

    #[test]
    fn test_malformed_start_line() {
        assert!(parse_head(b"NOSPACES\r\nHost: x\r\n\r\n").is_err());
    }

    #[test]
    fn test_header_missing_colon() {
        assert!(parse_head(b"GET / HTTP/1.1\r\nBadHeader\r\n\r\n").is_err());
    }
}
