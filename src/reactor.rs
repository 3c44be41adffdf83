//! Thin epoll wrapper plus the eventfd used to poke the dispatch thread.
//!
//! Every registration carries a caller-chosen `u64` token. Connection registrations
//! are always one-shot: after an event fires the descriptor stays silent until
//! `mod_fd` re-arms it.

use std::io;
use std::ops::BitOr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("invalid descriptor {0}")]
    InvalidFd(RawFd),
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl ReactorError {
    fn last_os(op: &'static str) -> Self {
        ReactorError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// Set of epoll event bits to register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);
    const NONE: Interest = Interest(0);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Edge- vs level-triggered behavior for the listener and for connections, chosen
/// once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerMode {
    pub listen_edge: bool,
    pub conn_edge: bool,
}

impl TriggerMode {
    /// `TRIGMODE` codes: 0 level/level, 1 level listener + edge connections,
    /// 2 edge listener + level connections, 3 edge/edge. Anything else is 3.
    pub fn from_code(code: u8) -> Self {
        let (listen_edge, conn_edge) = match code {
            0 => (false, false),
            1 => (false, true),
            2 => (true, false),
            _ => (true, true),
        };
        Self {
            listen_edge,
            conn_edge,
        }
    }

    pub fn code(self) -> u8 {
        match (self.listen_edge, self.conn_edge) {
            (false, false) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (true, true) => 3,
        }
    }

    pub fn listen_interest(self) -> Interest {
        let base = Interest::READABLE | Interest::PEER_CLOSED;
        if self.listen_edge { base | Interest::EDGE } else { base }
    }

    /// Bits ORed into every connection registration on top of READABLE/WRITABLE.
    pub fn conn_flags(self) -> Interest {
        let base = Interest::ONESHOT | Interest::PEER_CLOSED;
        if self.conn_edge { base | Interest::EDGE } else { base }
    }
}

impl Default for TriggerMode {
    fn default() -> Self {
        Self::from_code(3)
    }
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readiness: u32,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readiness & libc::EPOLLIN as u32 != 0
    }

    pub fn is_writable(&self) -> bool {
        self.readiness & libc::EPOLLOUT as u32 != 0
    }

    /// Peer hangup or socket error.
    pub fn is_closed(&self) -> bool {
        self.readiness & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0
    }
}

pub struct Epoll {
    fd: OwnedFd,
    buf: Vec<libc::epoll_event>,
}

impl Epoll {
    /// `max_events` bounds how many notifications one `wait` can return.
    pub fn new(max_events: usize) -> Result<Self, ReactorError> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("epoll_create1"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    pub fn add_fd(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), ReactorError> {
        self.ctl(libc::EPOLL_CTL_ADD, "epoll_ctl(ADD)", fd, token, interest)
    }

    pub fn mod_fd(&self, fd: RawFd, token: u64, interest: Interest) -> Result<(), ReactorError> {
        self.ctl(libc::EPOLL_CTL_MOD, "epoll_ctl(MOD)", fd, token, interest)
    }

    pub fn del_fd(&self, fd: RawFd) -> Result<(), ReactorError> {
        self.ctl(libc::EPOLL_CTL_DEL, "epoll_ctl(DEL)", fd, 0, Interest::NONE)
    }

    /// Block until something is ready or `timeout` elapses (`None` waits forever).
    /// Ready events replace the contents of `out`. An interrupted wait yields no events.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        out: &mut Vec<Event>,
    ) -> Result<usize, ReactorError> {
        out.clear();
        let timeout_ms = timeout.map_or(-1, timeout_millis);
        let n = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(ReactorError::Os {
                op: "epoll_wait",
                source: err,
            });
        }
        out.extend(self.buf[..n as usize].iter().map(|ev| {
            let (readiness, token) = (ev.events, ev.u64);
            Event { token, readiness }
        }));
        Ok(out.len())
    }

    fn ctl(
        &self,
        op: libc::c_int,
        name: &'static str,
        fd: RawFd,
        token: u64,
        interest: Interest,
    ) -> Result<(), ReactorError> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        let mut ev = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut ev) };
        if rc < 0 {
            return Err(ReactorError::last_os(name));
        }
        Ok(())
    }
}

/// Round up to whole milliseconds so a short deadline never turns into a zero-timeout spin.
fn timeout_millis(d: Duration) -> libc::c_int {
    let ms = d.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}

/// Non-blocking eventfd. Any thread may `wake`; the dispatch thread registers it with
/// the reactor and `drain`s it when it fires.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> Result<Self, ReactorError> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ReactorError::last_os("eventfd"));
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) {
        let val: u64 = 1;
        // EAGAIN means the counter is saturated, which still leaves it readable.
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
