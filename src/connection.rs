//! Per-connection state: socket, read/write buffers, parser, response builder and the
//! header + file-body write vector.
//!
//! A `Connection` is owned by exactly one thread at a time. The dispatch thread moves
//! it into a worker task, the task drives `on_read`/`on_write`, and the returned
//! [`Next`] tells the dispatch thread how to re-arm it.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use socket2::Socket;
use tracing::{debug, warn};

use crate::buffer::ByteBuffer;
use crate::constants::WRITE_HIGH_WATER_MARK;
use crate::metrics;
use crate::request::{ParseStatus, RequestParser};
use crate::response::ResponseBuilder;
use crate::users::UserPool;

/// Settings shared by every connection of one server.
#[derive(Clone)]
pub struct ConnContext {
    pub root: PathBuf,
    pub conn_edge: bool,
    pub users: Option<Arc<UserPool>>,
}

/// What the dispatch thread should do once a task hands the connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

pub struct Connection {
    socket: Socket,
    peer: SocketAddr,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    parser: RequestParser,
    response: ResponseBuilder,
    /// Bytes of the mapped body already written.
    file_sent: usize,
    keep_alive: bool,
    ctx: Arc<ConnContext>,
}

impl Connection {
    pub fn new(socket: Socket, peer: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        Self {
            socket,
            peer,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            parser: RequestParser::new(),
            response: ResponseBuilder::new(),
            file_sent: 0,
            keep_alive: false,
            ctx,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn response(&self) -> &ResponseBuilder {
        &self.response
    }

    /// Header bytes plus unsent file bytes.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.file_remaining()
    }

    fn file_remaining(&self) -> usize {
        self.response.file_len() - self.file_sent
    }

    /// Readable event: drain the socket, then try to answer.
    pub fn on_read(&mut self) -> Next {
        match self.read() {
            Ok(0) => {
                debug!(peer = %self.peer, "peer closed");
                Next::Close
            }
            Ok(_) => self.process(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.process(),
            Err(e) => {
                debug!(peer = %self.peer, "read failed: {e}");
                Next::Close
            }
        }
    }

    /// Writable event: push out the pending response.
    pub fn on_write(&mut self) -> Next {
        let result = self.write();
        if self.to_write_bytes() == 0 {
            self.response.unmap_file();
            self.file_sent = 0;
            return if self.keep_alive {
                self.process()
            } else {
                Next::Close
            };
        }
        match result {
            Ok(_) => Next::Write,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Write,
            Err(e) => {
                warn!(peer = %self.peer, "write failed: {e}");
                Next::Close
            }
        }
    }

    /// Read until the socket would block (edge-triggered) or once (level-triggered).
    /// `Ok(0)` means the peer closed before sending anything. `WouldBlock` is returned
    /// only if nothing at all was read.
    pub fn read(&mut self) -> io::Result<usize> {
        let fd = self.fd();
        let mut total = 0;
        loop {
            match self.read_buf.read_from_fd(fd) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if !self.ctx.conn_edge {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => {
                    return Ok(total);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Vectored write of headers then file body. Edge-triggered connections loop until
    /// drained or blocked; level-triggered ones keep going only while a large tail remains.
    pub fn write(&mut self) -> io::Result<usize> {
        let fd = self.fd();
        let mut total = 0;
        loop {
            if self.to_write_bytes() == 0 {
                break;
            }
            let header = self.write_buf.peek();
            let body = self
                .response
                .file()
                .map_or(&[][..], |file| &file[self.file_sent..]);
            let iov = [
                libc::iovec {
                    iov_base: header.as_ptr() as *mut libc::c_void,
                    iov_len: header.len(),
                },
                libc::iovec {
                    iov_base: body.as_ptr() as *mut libc::c_void,
                    iov_len: body.len(),
                },
            ];
            let header_len = header.len();

            // SAFETY: both iovecs describe live slices borrowed from `self` for the call.
            let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let n = n as usize;
            if n > header_len {
                self.file_sent += n - header_len;
                self.write_buf.clear();
            } else {
                self.write_buf.advance(n);
            }
            total += n;
            metrics::add_bytes_sent(n);

            if !(self.ctx.conn_edge || self.to_write_bytes() > WRITE_HIGH_WATER_MARK) {
                break;
            }
        }
        Ok(total)
    }

    /// Parse what has arrived and, once a request is complete, stage its response.
    pub fn process(&mut self) -> Next {
        if self.read_buf.readable_bytes() == 0 {
            return Next::Read;
        }

        let users = self.ctx.users.as_deref();
        let status = match self.parser.parse(&mut self.read_buf, users) {
            Ok(ParseStatus::Incomplete) => return Next::Read,
            Ok(ParseStatus::Complete) => {
                self.keep_alive = self.parser.is_keep_alive();
                None
            }
            Err(e) => {
                debug!(peer = %self.peer, "bad request: {e}");
                self.keep_alive = false;
                self.read_buf.clear();
                Some(400)
            }
        };
        metrics::inc_requests();

        self.response
            .init(&self.ctx.root, self.parser.path(), self.keep_alive, status);
        self.response.make_response(&mut self.write_buf);
        self.file_sent = 0;
        self.parser.reset();

        let code = self.response.code().unwrap_or(400);
        metrics::inc_responses(code);
        debug!(
            peer = %self.peer,
            code,
            path = self.response.path(),
            bytes = self.to_write_bytes(),
            "response staged"
        );
        Next::Write
    }
}
