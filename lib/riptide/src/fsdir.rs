use hashbrown::HashMap;
use keel::{ErrorKind, NetError, NetResult};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::time::UNIX_EPOCH;

/// Size and modification time of a served file.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FileStat {
    pub size: u64,
    /// Modification time, unix seconds.
    pub mtime: u64,
    pub is_dir: bool,
}

/// Filesystem collaborator used by the static-serving framers. The runtime
/// calls this only from `serve_dir`/`serve_file`; everything else is
/// filesystem-free.
pub trait FileProvider {
    fn stat(&self, path: &str) -> Option<FileStat>;
    fn open(&mut self, path: &str) -> NetResult<u64>;
    fn read(&mut self, handle: u64, offset: u64, buf: &mut [u8]) -> NetResult<usize>;
    fn close(&mut self, handle: u64);
}

/// Standard-library file provider.
pub struct StdFs {
    handles: HashMap<u64, fs::File>,
    next_handle: u64,
}

impl StdFs {
    pub fn new() -> StdFs {
        StdFs {
            handles: HashMap::new(),
            next_handle: 1,
        }
    }
}

impl FileProvider for StdFs {
    fn stat(&self, path: &str) -> Option<FileStat> {
        let meta = fs::metadata(path).ok()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|dur| dur.as_secs())
            .unwrap_or(0);

        Some(FileStat {
            size: meta.len(),
            mtime,
            is_dir: meta.is_dir(),
        })
    }

    fn open(&mut self, path: &str) -> NetResult<u64> {
        let file = fs::File::open(path)
            .map_err(|err| NetError::Fatal(ErrorKind::Socket(err.kind())))?;

        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(handle, file);
        Ok(handle)
    }

    fn read(&mut self, handle: u64, offset: u64, buf: &mut [u8]) -> NetResult<usize> {
        let file = self
            .handles
            .get_mut(&handle)
            .ok_or(NetError::Fatal(ErrorKind::Usage("unknown file handle")))?;

        file.seek(SeekFrom::Start(offset))
            .map_err(|err| NetError::Fatal(ErrorKind::Socket(err.kind())))?;

        file.read(buf)
            .map_err(|err| NetError::Fatal(ErrorKind::Socket(err.kind())))
    }

    fn close(&mut self, handle: u64) {
        self.handles.remove(&handle);
    }
}

/// Looks up the MIME type for a path, consulting caller overrides first and
/// the built-in table second.
pub fn mime_type<'a>(path: &str, overrides: &[(&'a str, &'a str)]) -> &'a str {
    let ext = match path.rfind('.') {
        Some(dot) => &path[dot + 1..],
        None => "",
    };

    for (candidate, mime) in overrides {
        if candidate.eq_ignore_ascii_case(ext) {
            return mime;
        }
    }

    builtin_mime(ext)
}

fn builtin_mime(ext: &str) -> &'static str {
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "text/xml",
        "csv" => "text/csv",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_mime_override_beats_builtin() {
        assert_eq!(mime_type("a/b.html", &[]), "text/html; charset=utf-8");
        assert_eq!(mime_type("a/b.html", &[("html", "text/x-custom")]), "text/x-custom");
        assert_eq!(mime_type("a/b.blob", &[]), "application/octet-stream");
        assert_eq!(mime_type("noext", &[]), "application/octet-stream");
    }

    #[test]
    fn test_stdfs_roundtrip() {
        let dir = std::env::temp_dir().join("riptide-fsdir-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.txt");
        fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let path = path.to_str().unwrap().to_owned();
        let mut provider = StdFs::new();

        let stat = provider.stat(&path).unwrap();
        assert_eq!(stat.size, 10);
        assert!(!stat.is_dir);

        let handle = provider.open(&path).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(provider.read(handle, 3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");
        provider.close(handle);

        assert!(provider.read(handle, 0, &mut buf).is_err());
    }

    #[test]
    fn test_stdfs_missing_file() {
        let mut provider = StdFs::new();
        assert!(provider.stat("/definitely/not/here").is_none());
        assert!(provider.open("/definitely/not/here").is_err());
    }
}
