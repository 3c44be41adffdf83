pub const CRLF: &[u8] = b"\r\n";

/// Initial capacity of a connection's read and write buffers.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// On-stack spill region used by `ByteBuffer::read_from_fd`.
pub const READ_OVERFLOW_SIZE: usize = 65535;

/// Level-triggered writers keep looping while more than this many bytes are pending.
pub const WRITE_HIGH_WATER_MARK: usize = 10240;

/// Hard ceiling on concurrently registered connections.
pub const MAX_CONNECTIONS: usize = 65536;

/// Events fetched per `epoll_wait`.
pub const MAX_EVENTS: usize = 1024;

pub const LISTEN_BACKLOG: i32 = 1024;

pub const LINGER_SECS: u64 = 3;

pub const BUSY_MESSAGE: &[u8] = b"Server busy!";

pub const DEFAULT_PORT: u16 = 5678;

const _: () = assert!(
    MAX_CONNECTIONS <= u32::MAX as usize,
    "connection keys are packed into 32 bits of the epoll token"
);
