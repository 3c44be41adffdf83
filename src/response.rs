//! Response head construction and zero-copy file bodies.
//!
//! `ResponseBuilder::make_response` writes the status line and headers into the
//! connection's write buffer and maps the requested file read-only. The mapping is
//! exposed through `file()` so the connection can hand it to `writev` as a second
//! I/O vector instead of copying it into the buffer.

use std::fs::{self, File, Metadata};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use tracing::{debug, warn};

use crate::buffer::ByteBuffer;

const KEEP_ALIVE_HINT: &str = "Keep-Alive: max=6, timeout=200\r\n";
const DEFAULT_CONTENT_TYPE: &str = "text/plain";

const SUFFIX_TYPES: [(&str, &str); 20] = [
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".word", "application/nsword"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".au", "audio/basic"),
    (".mpeg", "video/mpeg"),
    (".mpg", "video/mpeg"),
    (".avi", "video/x-msvideo"),
    (".gz", "application/x-gzip"),
    (".tar", "application/x-tar"),
    (".css", "text/css"),
    (".js", "text/javascript"),
    (".ico", "image/x-icon"),
];

pub fn reason_phrase(code: u16) -> Option<&'static str> {
    match code {
        200 => Some("OK"),
        400 => Some("Bad Request"),
        403 => Some("Forbidden"),
        404 => Some("Not Found"),
        _ => None,
    }
}

pub fn error_page(code: u16) -> Option<&'static str> {
    match code {
        400 => Some("/400.html"),
        403 => Some("/403.html"),
        404 => Some("/404.html"),
        _ => None,
    }
}

/// Content type for `path`, from its last `.` suffix.
pub fn content_type(path: &str) -> &'static str {
    let Some(idx) = path.rfind('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    let suffix = &path[idx..];
    SUFFIX_TYPES
        .iter()
        .find(|(s, _)| *s == suffix)
        .map(|(_, t)| *t)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

/// Read-only private mapping of a whole file. Unmapped exactly once, on drop.
pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is read-only and owned by exactly one `MappedFile`.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map `path`. Zero-length files cannot be mapped and are reported as `InvalidInput`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty file",
            ));
        }

        // SAFETY: fresh mapping of an open descriptor; the descriptor may be closed
        // afterwards without affecting the mapping.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is a live PROT_READ mapping of `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

pub struct ResponseBuilder {
    code: Option<u16>,
    keep_alive: bool,
    root: PathBuf,
    path: String,
    file: Option<MappedFile>,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self {
            code: None,
            keep_alive: false,
            root: PathBuf::new(),
            path: String::new(),
            file: None,
        }
    }

    /// Reset for a new response. Any mapping from the previous response is released here.
    pub fn init(&mut self, root: &Path, path: &str, keep_alive: bool, status_hint: Option<u16>) {
        self.unmap_file();
        self.code = status_hint;
        self.keep_alive = keep_alive;
        self.root = root.to_path_buf();
        self.path = path.to_string();
    }

    /// Status resolved by the last `make_response`, or the hint before that.
    pub fn code(&self) -> Option<u16> {
        self.code
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Zero-copy body, if the last response mapped a file.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(MappedFile::as_slice)
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, MappedFile::len)
    }

    pub fn unmap_file(&mut self) {
        self.file = None;
    }

    pub fn make_response(&mut self, buf: &mut ByteBuffer) {
        let code = self.resolve_code();
        self.code = Some(code);
        if let Some(page) = error_page(code) {
            self.path = page.to_string();
        }
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    fn full_path(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }

    fn resolve_code(&self) -> u16 {
        // An error hint wins over whatever the file system says.
        if let Some(code) = self.code.filter(|c| *c >= 400) {
            return code;
        }
        if self.path.split('/').any(|segment| segment == "..") {
            return 403;
        }
        match fs::metadata(self.full_path()) {
            Err(_) => 404,
            // Only regular files are served.
            Ok(meta) if !meta.is_file() => 404,
            Ok(meta) if !world_readable(&meta) => 403,
            Ok(_) => self.code.unwrap_or(200),
        }
    }

    fn add_status_line(&mut self, buf: &mut ByteBuffer) {
        let mut code = self.code.unwrap_or(400);
        let reason = match reason_phrase(code) {
            Some(reason) => reason,
            None => {
                code = 400;
                "Bad Request"
            }
        };
        self.code = Some(code);
        buf.append(format!("HTTP/1.1 {code} {reason}\r\n").as_bytes());
    }

    fn add_headers(&self, buf: &mut ByteBuffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(KEEP_ALIVE_HINT.as_bytes());
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-Type: {}\r\n", content_type(&self.path)).as_bytes());
    }

    fn add_content(&mut self, buf: &mut ByteBuffer) {
        let full_path = self.full_path();
        match fs::metadata(&full_path) {
            Ok(meta) if meta.is_file() && meta.len() == 0 => {
                buf.append(b"Content-Length: 0\r\n\r\n");
                return;
            }
            _ => {}
        }

        match MappedFile::open(&full_path) {
            Ok(file) => {
                debug!(path = %full_path.display(), len = file.len(), "mapped file");
                buf.append(format!("Content-Length: {}\r\n\r\n", file.len()).as_bytes());
                self.file = Some(file);
            }
            Err(e) => {
                warn!(path = %full_path.display(), "cannot map file: {e}");
                self.error_content(buf, "File NotFound!");
            }
        }
    }

    /// Inline HTML body, used when the target file cannot be opened or mapped.
    pub fn error_content(&self, buf: &mut ByteBuffer, message: &str) {
        let code = self.code.filter(|c| error_page(*c).is_some()).unwrap_or(400);
        let reason = reason_phrase(code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{code} : {reason}\n<p>{message}</p><hr><em>webreactor</em></body></html>"
        );
        buf.append(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

fn world_readable(meta: &Metadata) -> bool {
    meta.permissions().mode() & (libc::S_IROTH as u32) != 0
}
