//! Growable byte buffer with read/write cursors.
//!
//! Layout: `[0, read_pos)` is already consumed, `[read_pos, write_pos)` is readable,
//! `[write_pos, capacity)` is writable. `read_pos <= write_pos <= capacity` always holds.
//! A buffer is owned by exactly one connection and is never shared between threads
//! while a task is using it.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

use crate::constants::{DEFAULT_BUFFER_SIZE, READ_OVERFLOW_SIZE};

/// Error returned when a retrieval asks for more bytes than are readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("requested {requested} bytes but only {readable} are readable")]
pub struct BufferError {
    pub requested: usize,
    pub readable: usize,
}

pub struct ByteBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// View of the readable region. Does not move the read cursor.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.ensure_writable(bytes.len());
        self.data[self.write_pos..self.write_pos + bytes.len()].copy_from_slice(bytes);
        self.write_pos += bytes.len();
    }

    /// Copy out and consume exactly `n` readable bytes.
    pub fn retrieve(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        let readable = self.readable_bytes();
        if n > readable {
            return Err(BufferError {
                requested: n,
                readable,
            });
        }
        let out = self.data[self.read_pos..self.read_pos + n].to_vec();
        self.read_pos += n;
        Ok(out)
    }

    /// Consume everything up to and including `delimiter`.
    ///
    /// When the delimiter is absent the result depends on whether a line boundary
    /// (`\n`) is still buffered: if it is, more data may complete the line and the
    /// empty vector is returned; if it is not, the remaining bytes are a final
    /// fragment and are returned whole.
    pub fn retrieve_until(&mut self, delimiter: &[u8]) -> Vec<u8> {
        if delimiter.is_empty() || self.readable_bytes() < delimiter.len() {
            return Vec::new();
        }
        let readable = self.peek();
        match find(readable, delimiter) {
            Some(pos) => {
                let len = pos + delimiter.len();
                let out = readable[..len].to_vec();
                self.read_pos += len;
                out
            }
            None if readable.contains(&b'\n') => Vec::new(),
            None => self.retrieve_all(),
        }
    }

    pub fn retrieve_all(&mut self) -> Vec<u8> {
        let out = self.peek().to_vec();
        self.clear();
        out
    }

    /// Discard `n` readable bytes without copying them. `n` is clamped to what is readable.
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.readable_bytes());
        self.read_pos += n;
        if self.read_pos == self.write_pos {
            self.clear();
        }
    }

    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Read from `fd` with a single `readv` into the writable tail plus an on-stack
    /// overflow region. Bytes that land in the overflow are appended afterwards.
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut overflow = [0u8; READ_OVERFLOW_SIZE];
        let writable = self.writable_bytes();
        let tail = self.data[self.write_pos..].as_mut_ptr();
        let iov = [
            libc::iovec {
                iov_base: tail as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: overflow.as_mut_ptr() as *mut libc::c_void,
                iov_len: overflow.len(),
            },
        ];

        // SAFETY: both iovecs point at live, exclusively borrowed memory of the stated length.
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&overflow[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` with a single `write`. A partial write only
    /// consumes the bytes actually sent; callers loop until drained.
    pub fn write_to_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.peek();
        // SAFETY: the pointer/length pair describes the readable region of `self.data`.
        let n = unsafe {
            libc::write(
                fd,
                readable.as_ptr() as *const libc::c_void,
                readable.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.advance(n as usize);
        Ok(n as usize)
    }

    fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.writable_bytes() + self.read_pos >= len {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.data.resize(self.write_pos + len, 0);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
