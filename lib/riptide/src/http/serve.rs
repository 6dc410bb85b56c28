use crate::conn::Connection;
use crate::fsdir::{mime_type, FileProvider};
use crate::http::parse::HttpMessage;
use keel::{ErrorKind, NetError, NetResult};

const READ_CHUNK: usize = 8192;

/// Static-serving policy knobs for `serve_dir`.
pub struct ServeOpts<'a> {
    /// Directory the request uri is resolved under.
    pub root: &'a str,
    pub extra_headers: &'a [(&'a str, &'a str)],
    /// Extension → MIME overrides, consulted before the built-in table.
    pub mime_types: &'a [(&'a str, &'a str)],
    /// File served (with status 404) when the uri resolves to nothing.
    pub page404: Option<&'a str>,
}

impl<'a> Default for ServeOpts<'a> {
    fn default() -> ServeOpts<'a> {
        ServeOpts {
            root: ".",
            extra_headers: &[],
            mime_types: &[],
            page404: None,
        }
    }
}

/// Reason phrase for a status code.
pub fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

impl Connection {
    /// Writes a complete response. `Content-Length` is derived from the
    /// body; `Content-Type: text/plain` is added when the caller supplies
    /// no content type of their own. Closing afterwards is the caller's
    /// choice via `drain()`.
    pub fn reply(&mut self, status: u16, headers: &[(&str, &str)], body: &[u8]) -> NetResult<()> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));

        let mut has_type = false;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("Content-Type") {
                has_type = true;
            }
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        if !has_type {
            head.push_str("Content-Type: text/plain\r\n");
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

        self.send_bytes(head.as_bytes())?;
        self.send_bytes(body)
    }

    /// Writes one chunk in chunked transfer encoding: hex length line, the
    /// data, and a trailing CRLF. An empty chunk terminates the body. The
    /// caller is responsible for having sent `Transfer-Encoding: chunked`.
    pub fn http_chunk(&mut self, data: &[u8]) -> NetResult<()> {
        self.send_bytes(format!("{:x}\r\n", data.len()).as_bytes())?;
        self.send_bytes(data)?;
        self.send_bytes(b"\r\n")
    }

    /// Writes one server-sent event: the `event:` line, one `data:` line
    /// per line of payload, and the blank separator line.
    pub fn http_sse(&mut self, event: &str, data: &str) -> NetResult<()> {
        let mut out = format!("event: {}\n", event);
        for line in data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');

        self.send_bytes(out.as_bytes())
    }

    /// Appends a basic-auth header to an outbound request being composed
    /// in the send buffer.
    pub fn http_basic_auth(&mut self, user: &str, pass: &str) -> NetResult<()> {
        let credentials = base64::encode(format!("{}:{}", user, pass));
        self.send_bytes(format!("Authorization: Basic {}\r\n", credentials).as_bytes())
    }

    /// Resolves the request uri under `opts.root` and serves the file
    /// there. Directories fall through to their `index.html`. Traversal
    /// outside the root is refused.
    pub fn serve_dir(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &mut dyn FileProvider,
        opts: &ServeOpts<'_>,
    ) -> NetResult<()> {
        let uri = msg.uri();

        if uri.split('/').any(|segment| segment == "..") {
            return self.serve_miss(msg, provider, opts);
        }

        let mut path = format!("{}{}", opts.root.trim_end_matches('/'), uri);

        match provider.stat(&path) {
            None => return self.serve_miss(msg, provider, opts),
            Some(stat) if stat.is_dir => {
                if !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str("index.html");

                if provider.stat(&path).is_none() {
                    return self.serve_miss(msg, provider, opts);
                }
            }
            Some(_) => (),
        }

        self.serve_path(msg, provider, &path, 200, opts.extra_headers, opts.mime_types)
    }

    /// Serves a single file path with the same conditional/range policies
    /// as `serve_dir`.
    pub fn serve_file(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &mut dyn FileProvider,
        path: &str,
        extra_headers: &[(&str, &str)],
        mime_types: &[(&str, &str)],
    ) -> NetResult<()> {
        if provider.stat(path).is_none() {
            return self.reply(404, extra_headers, b"Not Found");
        }

        self.serve_path(msg, provider, path, 200, extra_headers, mime_types)
    }

    fn serve_miss(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &mut dyn FileProvider,
        opts: &ServeOpts<'_>,
    ) -> NetResult<()> {
        if let Some(page) = opts.page404 {
            if provider.stat(page).is_some() {
                return self.serve_path(msg, provider, page, 404, opts.extra_headers, opts.mime_types);
            }
        }

        self.reply(404, opts.extra_headers, b"Not Found")
    }

    fn serve_path(
        &mut self,
        msg: &HttpMessage<'_>,
        provider: &mut dyn FileProvider,
        path: &str,
        status: u16,
        extra_headers: &[(&str, &str)],
        mime_types: &[(&str, &str)],
    ) -> NetResult<()> {
        let stat = provider
            .stat(path)
            .ok_or(NetError::Fatal(ErrorKind::Usage("serve_path on missing file")))?;

        let etag = format!("\"{}.{}\"", stat.mtime, stat.size);

        if msg.header("If-None-Match") == Some(etag.as_str()) {
            let mut head = format!("HTTP/1.1 304 {}\r\nEtag: {}\r\n", status_text(304), etag);
            for (name, value) in extra_headers {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
            head.push_str("Content-Length: 0\r\n\r\n");
            return self.send_bytes(head.as_bytes());
        }

        // A single `bytes=from-to` range is honored; anything else gets
        // the whole file.
        let (status, offset, length, content_range) = match msg.header("Range") {
            Some(range) if status == 200 => match parse_range(range, stat.size) {
                Some((offset, length)) => (
                    206,
                    offset,
                    length,
                    Some(format!(
                        "bytes {}-{}/{}",
                        offset,
                        offset + length.saturating_sub(1),
                        stat.size
                    )),
                ),
                None => {
                    let head = format!(
                        "HTTP/1.1 416 {}\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                        status_text(416),
                        stat.size
                    );
                    return self.send_bytes(head.as_bytes());
                }
            },
            _ => (status, 0, stat.size, None),
        };

        let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
        head.push_str(&format!("Content-Type: {}\r\n", mime_type(path, mime_types)));
        head.push_str(&format!("Etag: {}\r\n", etag));
        if let Some(range) = content_range {
            head.push_str(&format!("Content-Range: {}\r\n", range));
        }
        for (name, value) in extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n\r\n", length));

        self.send_bytes(head.as_bytes())?;

        if msg.method().eq_ignore_ascii_case("HEAD") {
            return Ok(());
        }

        let handle = provider.open(path)?;
        let mut remaining = length;
        let mut cursor = offset;
        let mut chunk = [0u8; READ_CHUNK];

        while remaining > 0 {
            let want = (remaining as usize).min(READ_CHUNK);
            let got = match provider.read(handle, cursor, &mut chunk[..want]) {
                Ok(0) | Err(_) => break,
                Ok(got) => got,
            };

            self.send_bytes(&chunk[..got])?;
            cursor += got as u64;
            remaining -= got as u64;
        }

        provider.close(handle);
        Ok(())
    }
}

/// Parses `bytes=from-to` against the entity size. Returns byte offset and
/// length, or `None` when the range is unsatisfiable.
fn parse_range(header: &str, size: u64) -> Option<(u64, u64)> {
    let spec = header.strip_prefix("bytes=")?;
    let mut parts = spec.splitn(2, '-');
    let from = parts.next()?.trim();
    let to = parts.next()?.trim();

    if from.is_empty() {
        // Suffix range: last N bytes.
        let tail: u64 = to.parse().ok()?;
        if tail == 0 {
            return None;
        }
        let length = tail.min(size);
        return Some((size - length, length));
    }

    let from: u64 = from.parse().ok()?;
    if from >= size {
        return None;
    }

    let end = if to.is_empty() {
        size - 1
    } else {
        to.parse::<u64>().ok()?.min(size - 1)
    };

    if end < from {
        return None;
    }

    Some((from, end - from + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{Connection, Proto};
    use crate::fsdir::StdFs;
    use crate::http::parse::{self, HttpProgress};
    use keel::logging;
    use std::fs;
    use std::io::Write;

    fn conn() -> Connection {
        Connection::virtual_endpoint(1, Proto::Http, logging::discard())
    }

    fn parse_response(raw: &[u8]) -> (u16, Vec<(String, String)>, Vec<u8>) {
        match parse::next_message(raw, true).unwrap() {
            HttpProgress::Message {
                scratch, body_len, ..
            } => {
                let msg = parse::view(&scratch, body_len);
                let headers = msg
                    .headers()
                    .map(|(name, value)| (name.to_owned(), value.to_owned()))
                    .collect();
                (msg.status(), headers, msg.body().to_vec())
            }
            _ => panic!("incomplete response"),
        }
    }

    fn request(raw: &[u8]) -> Vec<u8> {
        raw.to_vec()
    }

    fn get(uri: &str, extra: &str) -> Vec<u8> {
        request(format!("GET {} HTTP/1.1\r\nHost: x\r\n{}\r\n", uri, extra).as_bytes())
    }

    #[test]
    fn test_reply_roundtrip() {
        let mut conn = conn();
        conn.reply(200, &[], b"ok").unwrap();

        let (status, headers, body) = parse_response(conn.send.read_slice());

        assert_eq!(status, 200);
        assert_eq!(body, b"ok");
        assert!(headers.contains(&("Content-Type".to_owned(), "text/plain".to_owned())));
        assert!(headers.contains(&("Content-Length".to_owned(), "2".to_owned())));
    }

    #[test]
    fn test_reply_custom_content_type_not_overridden() {
        let mut conn = conn();
        conn.reply(201, &[("Content-Type", "application/json")], b"{}")
            .unwrap();

        let (status, headers, _) = parse_response(conn.send.read_slice());
        assert_eq!(status, 201);
        assert_eq!(
            headers
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case("content-type"))
                .count(),
            1
        );
        assert!(headers.contains(&("Content-Type".to_owned(), "application/json".to_owned())));
    }

    #[test]
    fn test_chunk_writer_framing() {
        let mut conn = conn();
        conn.http_chunk(b"hello").unwrap();
        conn.http_chunk(b" world!!!!!!!!!!!").unwrap();
        conn.http_chunk(b"").unwrap();

        assert_eq!(
            conn.send.read_slice(),
            b"5\r\nhello\r\n11\r\n world!!!!!!!!!!!\r\n0\r\n\r\n".as_ref()
        );

        // The emitted chunk stream decodes back to the payload.
        let (_, body) = parse::dechunk(conn.send.read_slice()).unwrap().unwrap();
        assert_eq!(body, b"hello world!!!!!!!!!!!");
    }

    #[test]
    fn test_sse_framing() {
        let mut conn = conn();
        conn.http_sse("tick", "one\ntwo").unwrap();

        assert_eq!(
            conn.send.read_slice(),
            b"event: tick\ndata: one\ndata: two\n\n".as_ref()
        );
    }

    #[test]
    fn test_basic_auth_header() {
        let mut conn = conn();
        conn.http_basic_auth("user", "pass").unwrap();

        assert_eq!(
            conn.send.read_slice(),
            b"Authorization: Basic dXNlcjpwYXNz\r\n".as_ref()
        );
    }

    struct SiteFixture {
        root: String,
    }

    impl SiteFixture {
        fn new(tag: &str) -> SiteFixture {
            let root = std::env::temp_dir().join(format!("riptide-serve-{}", tag));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(root.join("sub")).unwrap();

            fs::File::create(root.join("index.html"))
                .unwrap()
                .write_all(b"<h1>home</h1>")
                .unwrap();
            fs::File::create(root.join("data.bin"))
                .unwrap()
                .write_all(&(0..=99).collect::<Vec<u8>>())
                .unwrap();
            fs::File::create(root.join("404.html"))
                .unwrap()
                .write_all(b"gone")
                .unwrap();

            SiteFixture {
                root: root.to_str().unwrap().to_owned(),
            }
        }

        fn opts(&self) -> ServeOpts<'_> {
            ServeOpts {
                root: &self.root,
                ..ServeOpts::default()
            }
        }
    }

    #[test]
    fn test_serve_dir_file_hit() {
        let site = SiteFixture::new("hit");
        let raw = get("/data.bin", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, headers, body) = parse_response(conn.send.read_slice());
        assert_eq!(status, 200);
        assert_eq!(body, (0..=99).collect::<Vec<u8>>());
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Content-Type" && value == "application/octet-stream"));
    }

    #[test]
    fn test_serve_dir_index_fallthrough() {
        let site = SiteFixture::new("index");
        let raw = get("/", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, _, body) = parse_response(conn.send.read_slice());
        assert_eq!(status, 200);
        assert_eq!(body, b"<h1>home</h1>");
    }

    #[test]
    fn test_serve_dir_missing_is_404() {
        let site = SiteFixture::new("miss");
        let raw = get("/nope.txt", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, _, _) = parse_response(conn.send.read_slice());
        assert_eq!(status, 404);
    }

    #[test]
    fn test_serve_dir_page404() {
        let site = SiteFixture::new("page404");
        let page = format!("{}/404.html", site.root);
        let opts = ServeOpts {
            root: &site.root,
            page404: Some(&page),
            ..ServeOpts::default()
        };

        let raw = get("/nope.txt", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &opts).unwrap();

        let (status, _, body) = parse_response(conn.send.read_slice());
        assert_eq!(status, 404);
        assert_eq!(body, b"gone");
    }

    #[test]
    fn test_serve_dir_traversal_refused() {
        let site = SiteFixture::new("traversal");
        let raw = get("/../secret.txt", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, _, _) = parse_response(conn.send.read_slice());
        assert_eq!(status, 404);
    }

    #[test]
    fn test_range_request_206() {
        let site = SiteFixture::new("range");
        let raw = get("/data.bin", "Range: bytes=10-19\r\n");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, headers, body) = parse_response(conn.send.read_slice());
        assert_eq!(status, 206);
        assert_eq!(body, (10..=19).collect::<Vec<u8>>());
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Content-Range" && value == "bytes 10-19/100"));
    }

    #[test]
    fn test_range_unsatisfiable_416() {
        let site = SiteFixture::new("badrange");
        let raw = get("/data.bin", "Range: bytes=500-\r\n");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, headers, _) = parse_response(conn.send.read_slice());
        assert_eq!(status, 416);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Content-Range" && value == "bytes */100"));
    }

    #[test]
    fn test_not_modified_304() {
        let site = SiteFixture::new("etag");
        let raw = get("/data.bin", "");
        let msg = parse::view(&raw, 0);

        let mut conn = conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();
        let (_, headers, _) = parse_response(conn.send.read_slice());
        let etag = headers
            .iter()
            .find(|(name, _)| name == "Etag")
            .map(|(_, value)| value.clone())
            .unwrap();

        let raw = get("/data.bin", &format!("If-None-Match: {}\r\n", etag));
        let msg = parse::view(&raw, 0);

        let mut conn = self::conn();
        conn.serve_dir(&msg, &mut StdFs::new(), &site.opts()).unwrap();

        let (status, _, body) = parse_response(conn.send.read_slice());
        assert_eq!(status, 304);
        assert!(body.is_empty());
    }

    #[test]
    fn test_parse_range_rules() {
        assert_eq!(parse_range("bytes=0-9", 100), Some((0, 10)));
        assert_eq!(parse_range("bytes=90-", 100), Some((90, 10)));
        assert_eq!(parse_range("bytes=-10", 100), Some((90, 10)));
        assert_eq!(parse_range("bytes=90-200", 100), Some((90, 10)));
        assert_eq!(parse_range("bytes=100-", 100), None);
        assert_eq!(parse_range("bytes=20-10", 100), None);
        assert_eq!(parse_range("lines=1-2", 100), None);
    }
}
