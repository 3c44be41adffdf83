//! The dispatch loop.
//!
//! One thread owns the epoll instance, the timer heap and the connection table. Ready
//! connections are moved out of the table into a worker task; the task sends them back
//! over a completion channel and pokes the eventfd waker, and the dispatch thread
//! re-arms or closes them. A connection is therefore only ever touched by one thread.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use slab::Slab;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{ConnContext, Connection, Next};
use crate::constants::{BUSY_MESSAGE, LINGER_SECS, LISTEN_BACKLOG, MAX_EVENTS};
use crate::metrics;
use crate::reactor::{Epoll, Event, Interest, ReactorError, TriggerMode, Waker};
use crate::timer::TimerWheel;
use crate::users::UserPool;
use crate::worker_pool::WorkerPool;

const LISTENER_TOKEN: u64 = u64::MAX;
const WAKER_TOKEN: u64 = u64::MAX - 1;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("cannot start worker pool: {0}")]
    Workers(#[source] io::Error),
}

/// Generation-checked reference to a slot in the connection table. A handle outlives
/// its connection harmlessly: once the slot is reused the generations no longer match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle {
    key: u32,
    generation: u32,
}

impl ConnHandle {
    fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.key as u64
    }

    fn from_token(token: u64) -> Self {
        Self {
            key: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

enum Completion {
    Done(ConnHandle, Box<Connection>, Next),
    /// The task was dropped or panicked and took its connection with it.
    Lost(ConnHandle),
}

struct Slot {
    generation: u32,
    fd: RawFd,
    /// `None` while a worker owns the connection.
    conn: Option<Box<Connection>>,
    /// Set when the connection must go away as soon as its task hands it back.
    closing: bool,
}

/// Hands a connection back to the dispatch thread. Dropping it unused reports the
/// connection as lost so its slot is reclaimed.
struct CompletionGuard {
    handle: ConnHandle,
    tx: Sender<Completion>,
    waker: Arc<Waker>,
    sent: bool,
}

impl CompletionGuard {
    fn finish(mut self, conn: Box<Connection>, next: Next) {
        self.sent = true;
        let _ = self.tx.send(Completion::Done(self.handle, conn, next));
        self.waker.wake();
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Completion::Lost(self.handle));
            self.waker.wake();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

/// Stops a running dispatcher from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }
}

pub struct Dispatcher {
    epoll: Epoll,
    listener: Socket,
    local_addr: SocketAddr,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    mode: TriggerMode,
    timeout: Duration,
    max_connections: usize,
    next_generation: u32,
    conns: Slab<Slot>,
    timer: TimerWheel<ConnHandle>,
    expired_tx: Sender<ConnHandle>,
    expired_rx: Receiver<ConnHandle>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    pool: WorkerPool,
    ctx: Arc<ConnContext>,
    events: Vec<Event>,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, users: Option<Arc<UserPool>>) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener =
            create_listener(addr, config.open_linger).map_err(|source| ServerError::Listen {
                addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        let epoll = Epoll::new(MAX_EVENTS)?;
        let waker = Arc::new(Waker::new()?);
        epoll.add_fd(
            listener.as_raw_fd(),
            LISTENER_TOKEN,
            config.trigger.listen_interest(),
        )?;
        epoll.add_fd(waker.as_raw_fd(), WAKER_TOKEN, Interest::READABLE)?;

        let pool = WorkerPool::new(config.workers).map_err(ServerError::Workers)?;
        let (expired_tx, expired_rx) = mpsc::channel();
        let (completions_tx, completions_rx) = mpsc::channel();

        info!(
            addr = %local_addr,
            trigmode = config.trigger.code(),
            timeout_ms = config.timeout.as_millis() as u64,
            linger = config.open_linger,
            workers = pool.size(),
            max_conns = config.max_connections,
            root = %config.root.display(),
            "server init"
        );

        Ok(Self {
            epoll,
            listener,
            local_addr,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            mode: config.trigger,
            timeout: config.timeout,
            max_connections: config.max_connections,
            next_generation: 0,
            conns: Slab::with_capacity(config.max_connections.min(4096)),
            timer: TimerWheel::new(),
            expired_tx,
            expired_rx,
            completions_tx,
            completions_rx,
            pool,
            ctx: Arc::new(ConnContext {
                root: config.root.clone(),
                conn_edge: config.trigger.conn_edge,
                users,
            }),
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Registered connections, checked-out ones included.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn timer_len(&self) -> usize {
        self.timer.len()
    }

    /// Run until a `ShutdownHandle` fires.
    pub fn run(&mut self) -> Result<(), ServerError> {
        info!(addr = %self.local_addr, "server start");
        while !self.stop.load(Ordering::Acquire) {
            self.turn(None)?;
        }
        info!("server stopped");
        Ok(())
    }

    /// One loop iteration: fire due timers, wait for readiness (at most `max_wait`,
    /// if given), handle every event, then collect finished tasks. Returns the number
    /// of events handled.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> Result<usize, ServerError> {
        let next_tick = if self.timeout.is_zero() {
            None
        } else {
            self.timer.next_tick()
        };
        self.reap_expired();

        let wait = match (next_tick, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut events = std::mem::take(&mut self.events);
        let result = self.epoll.wait(wait, &mut events);
        if let Ok(n) = result {
            trace!(n, "epoll wait");
            for ev in &events {
                match ev.token {
                    LISTENER_TOKEN => self.accept(),
                    WAKER_TOKEN => self.waker.drain(),
                    token => self.on_conn_event(ConnHandle::from_token(token), ev),
                }
            }
        }
        self.events = events;
        self.drain_completions();
        Ok(result?)
    }

    fn on_conn_event(&mut self, handle: ConnHandle, ev: &Event) {
        let Some(slot) = self.slot(handle) else {
            trace!(?handle, "stale event");
            return;
        };
        if slot.closing || slot.conn.is_none() {
            return;
        }
        if ev.is_closed() {
            self.close(handle);
        } else if ev.is_readable() {
            self.dispatch(handle, Op::Read);
        } else if ev.is_writable() {
            self.dispatch(handle, Op::Write);
        } else {
            error!(?handle, readiness = ev.readiness, "unexpected event");
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((socket, addr)) => {
                    if self.conns.len() >= self.max_connections {
                        reject(socket);
                        metrics::inc_rejected();
                        warn!(peer = ?addr.as_socket(), "clients are full");
                    } else {
                        self.register(socket, &addr);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept failed: {e}");
                    return;
                }
            }
            if !self.mode.listen_edge {
                return;
            }
        }
    }

    fn register(&mut self, socket: Socket, addr: &SockAddr) {
        let peer = addr
            .as_socket()
            .unwrap_or(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        if let Err(e) = socket.set_nonblocking(true) {
            warn!(%peer, "cannot make socket non-blocking: {e}");
            return;
        }

        let entry = self.conns.vacant_entry();
        let handle = ConnHandle {
            key: entry.key() as u32,
            generation: self.next_generation,
        };
        self.next_generation = self.next_generation.wrapping_add(1);

        let conn = Box::new(Connection::new(socket, peer, Arc::clone(&self.ctx)));
        let fd = conn.fd();
        let interest = Interest::READABLE | self.mode.conn_flags();
        if let Err(e) = self.epoll.add_fd(fd, handle.token(), interest) {
            warn!(%peer, "cannot register connection: {e}");
            return;
        }
        entry.insert(Slot {
            generation: handle.generation,
            fd,
            conn: Some(conn),
            closing: false,
        });

        if !self.timeout.is_zero() {
            let expired = self.expired_tx.clone();
            self.timer.add(
                handle,
                self.timeout,
                Box::new(move || {
                    let _ = expired.send(handle);
                }),
            );
        }
        metrics::inc_accepted();
        info!(%peer, fd, clients = self.conns.len(), "client in");
    }

    /// Extend the idle deadline and hand the connection to a worker.
    fn dispatch(&mut self, handle: ConnHandle, op: Op) {
        if !self.timeout.is_zero() {
            self.timer.adjust(handle, self.timeout);
        }
        let Some(conn) = self.slot_mut(handle).and_then(|slot| slot.conn.take()) else {
            return;
        };

        let guard = CompletionGuard {
            handle,
            tx: self.completions_tx.clone(),
            waker: Arc::clone(&self.waker),
            sent: false,
        };
        let queued = self.pool.execute(move || {
            let mut conn = conn;
            let next = match op {
                Op::Read => conn.on_read(),
                Op::Write => conn.on_write(),
            };
            guard.finish(conn, next);
        });
        if !queued {
            debug!(?handle, "worker pool stopping, dropping task");
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            match completion {
                Completion::Done(handle, conn, next) => self.complete(handle, conn, next),
                Completion::Lost(handle) => {
                    // The connection (and its descriptor) died with the task; a closed
                    // descriptor has already left the epoll set.
                    if self.slot(handle).is_some() {
                        warn!(?handle, "connection lost in worker");
                        self.timer.remove(handle);
                        self.conns.remove(handle.key as usize);
                        metrics::inc_closed();
                    }
                }
            }
        }
    }

    fn complete(&mut self, handle: ConnHandle, conn: Box<Connection>, next: Next) {
        let flags = self.mode.conn_flags();
        let Some(slot) = self.slot_mut(handle) else {
            error!(?handle, "completion for unknown connection");
            let _ = self.epoll.del_fd(conn.fd());
            return;
        };
        if slot.closing {
            self.conns.remove(handle.key as usize);
            info!(peer = %conn.peer(), "client quit");
            metrics::inc_closed();
            return;
        }
        let fd = slot.fd;
        slot.conn = Some(conn);

        let interest = match next {
            Next::Read => Interest::READABLE,
            Next::Write => Interest::WRITABLE,
            Next::Close => {
                self.close(handle);
                return;
            }
        };
        if let Err(e) = self.epoll.mod_fd(fd, handle.token(), interest | flags) {
            warn!(?handle, "re-arm failed: {e}");
            self.close(handle);
        }
    }

    fn reap_expired(&mut self) {
        while let Ok(handle) = self.expired_rx.try_recv() {
            if self.slot(handle).is_some_and(|slot| !slot.closing) {
                debug!(?handle, "idle timeout");
                metrics::inc_timeouts();
                self.close(handle);
            }
        }
    }

    /// Deregister and drop a connection, or mark it for teardown if a worker holds it.
    fn close(&mut self, handle: ConnHandle) {
        self.timer.remove(handle);
        let Some(slot) = self.slot_mut(handle) else {
            return;
        };
        let fd = slot.fd;
        let checked_out = slot.conn.is_none();
        if checked_out {
            slot.closing = true;
        }
        if let Err(e) = self.epoll.del_fd(fd) {
            debug!(fd, "epoll del failed: {e}");
        }
        if checked_out {
            return;
        }
        let slot = self.conns.remove(handle.key as usize);
        if let Some(conn) = slot.conn {
            info!(peer = %conn.peer(), fd, "client quit");
        }
        metrics::inc_closed();
    }

    fn slot(&self, handle: ConnHandle) -> Option<&Slot> {
        self.conns
            .get(handle.key as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    fn slot_mut(&mut self, handle: ConnHandle) -> Option<&mut Slot> {
        self.conns
            .get_mut(handle.key as usize)
            .filter(|slot| slot.generation == handle.generation)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Joining the pool lets in-flight tasks finish and report back first.
        self.pool.shutdown();
        while self.completions_rx.try_recv().is_ok() {}
        for (_, slot) in self.conns.iter() {
            let _ = self.epoll.del_fd(slot.fd);
            metrics::inc_closed();
        }
        let open = self.conns.len();
        self.conns.clear();
        self.timer.clear();
        if open > 0 {
            info!(open, "closed remaining connections");
        }
    }
}

fn create_listener(addr: SocketAddr, open_linger: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if open_linger {
        socket.set_linger(Some(Duration::from_secs(LINGER_SECS)))?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket)
}

/// Tell an over-limit peer to go away without ever registering it. Accepted sockets
/// start out blocking; a peer with a full receive window just misses the notice.
fn reject(mut socket: Socket) {
    if let Err(e) = socket.set_nonblocking(true) {
        debug!("busy notice not delivered: {e}");
        return;
    }
    match socket.write_all(BUSY_MESSAGE) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!("busy notice not delivered: peer not reading")
        }
        Err(e) => debug!("busy notice not delivered: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_token_round_trip_avoids_reserved_tokens() {
        let handle = ConnHandle {
            key: 65535,
            generation: u32::MAX,
        };
        assert_eq!(ConnHandle::from_token(handle.token()), handle);
        assert_ne!(handle.token(), LISTENER_TOKEN);
        assert_ne!(handle.token(), WAKER_TOKEN);
    }

    #[test]
    fn guard_reports_lost_connection_on_drop() {
        let (tx, rx) = mpsc::channel();
        let waker = Arc::new(Waker::new().unwrap());
        let handle = ConnHandle {
            key: 3,
            generation: 9,
        };
        drop(CompletionGuard {
            handle,
            tx,
            waker,
            sent: false,
        });
        assert!(matches!(rx.try_recv(), Ok(Completion::Lost(h)) if h == handle));
    }

    #[test]
    fn reject_never_blocks_on_a_stalled_peer() {
        let (stalled, _peer) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        // Fill the send buffer so a blocking write could never complete.
        stalled.set_nonblocking(true).unwrap();
        let chunk = [0u8; 64 * 1024];
        while stalled.send(&chunk).is_ok() {}
        stalled.set_nonblocking(false).unwrap();

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            reject(stalled);
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_listener(addr, true).unwrap();
        let bound = socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(bound.port(), 0);
        assert_eq!(
            socket.linger().unwrap(),
            Some(Duration::from_secs(LINGER_SECS))
        );
    }
}
