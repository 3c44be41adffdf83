#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use webreactor::users::UserPool;
use webreactor::{Dispatcher, ServerConfig, ShutdownHandle};

pub const INDEX_HTML: &str = "<html><body>index</body></html>";
pub const NOT_FOUND_HTML: &str = "<html><body>404 page</body></html>";
pub const BAD_REQUEST_HTML: &str = "<html><body>400 page</body></html>";
pub const WELCOME_HTML: &str = "<html><body>welcome</body></html>";
pub const ERROR_HTML: &str = "<html><body>error</body></html>";

/// Document root in the system temp dir, removed on drop.
pub struct TestRoot {
    pub path: PathBuf,
}

impl TestRoot {
    pub fn new() -> Self {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "webreactor-it-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::SeqCst)
        ));
        fs::create_dir_all(&path).unwrap();
        for (name, body) in [
            ("index.html", INDEX_HTML),
            ("404.html", NOT_FOUND_HTML),
            ("400.html", BAD_REQUEST_HTML),
            ("403.html", "<html><body>403 page</body></html>"),
            ("welcome.html", WELCOME_HTML),
            ("error.html", ERROR_HTML),
            ("login.html", "<form>login</form>"),
            ("register.html", "<form>register</form>"),
            ("style.css", "body { color: red; }"),
        ] {
            fs::write(path.join(name), body).unwrap();
        }
        Self { path }
    }
}

impl Drop for TestRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn config(root: &TestRoot) -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        root: root.path.clone(),
        workers: 2,
        ..ServerConfig::default()
    }
}

/// A dispatcher running `run()` on its own thread; stopped and joined on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(config: ServerConfig) -> Self {
        Self::start_with_users(config, Some(Arc::new(UserPool::in_memory(2))))
    }

    pub fn start_with_users(config: ServerConfig, users: Option<Arc<UserPool>>) -> Self {
        let mut server = Dispatcher::new(&config, users).expect("dispatcher setup");
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let thread = thread::Builder::new()
            .name("dispatch".into())
            .spawn(move || server.run().expect("event loop"))
            .unwrap();
        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Turn the dispatcher until `cond` holds or two seconds pass.
pub fn turn_until(server: &mut Dispatcher, mut cond: impl FnMut(&Dispatcher) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond(server) {
            return true;
        }
        server.turn(Some(Duration::from_millis(20))).unwrap();
    }
    cond(server)
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

pub fn get_request(path: &str, keep_alive: bool) -> String {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: {connection}\r\n\r\n")
}

pub fn post_form(path: &str, body: &str) -> String {
    format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

pub fn read_response(reader: &mut BufReader<TcpStream>) -> HttpResponse {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {line:?}"));

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).unwrap();
        let trimmed = line.trim_end_matches("\r\n");
        if trimmed.is_empty() {
            break;
        }
        let (k, v) = trimmed.split_once(": ").unwrap();
        headers.push((k.to_string(), v.to_string()));
    }

    let len: usize = headers
        .iter()
        .find(|(k, _)| k == "Content-Length")
        .map(|(_, v)| v.parse().unwrap())
        .expect("Content-Length");
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).unwrap();
    HttpResponse {
        status,
        headers,
        body,
    }
}

/// Send `raw` on a fresh connection and read one response.
pub fn exchange(addr: SocketAddr, raw: &str) -> HttpResponse {
    let mut stream = connect(addr);
    stream.write_all(raw.as_bytes()).unwrap();
    read_response(&mut BufReader::new(stream))
}
