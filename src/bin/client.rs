use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(about = "Test client for the webreactor HTTP server")]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 5678)]
    port: u16,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch one path and print status, headers and body size (default: /)
    Get {
        #[arg(default_value = "/")]
        path: String,
        /// Print the body as well
        #[arg(short, long)]
        body: bool,
    },
    /// Hammer one path over keep-alive connections and report latency percentiles
    Bench {
        /// Number of concurrent connections
        #[arg(short, long, default_value_t = 4)]
        connections: usize,
        /// Requests per connection
        #[arg(short, long, default_value_t = 10_000)]
        requests: usize,
        #[arg(long, default_value = "/")]
        path: String,
    },
}

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn send_request(stream: &mut TcpStream, host: &str, path: &str, keep_alive: bool) -> Result<()> {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: {connection}\r\n\r\n");
    stream.write_all(req.as_bytes()).context("write failed")
}

fn read_response(reader: &mut BufReader<TcpStream>) -> Result<Response> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        bail!("connection closed before status line");
    }
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .with_context(|| format!("malformed status line {line:?}"))?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((k, v)) = trimmed.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let mut response = Response {
        status,
        headers,
        body: Vec::new(),
    };
    let len: usize = response
        .header("Content-Length")
        .context("missing Content-Length")?
        .parse()
        .context("bad Content-Length")?;
    response.body.resize(len, 0);
    reader
        .read_exact(&mut response.body)
        .context("short response body")?;
    Ok(response)
}

fn get(addr: &str, host: &str, path: &str, print_body: bool) -> Result<()> {
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    send_request(&mut stream, host, path, false)?;
    let mut reader = BufReader::new(stream);
    let response = read_response(&mut reader)?;

    eprintln!("status: {}", response.status);
    for (k, v) in &response.headers {
        eprintln!("  {k}: {v}");
    }
    eprintln!("body: {} bytes", response.body.len());
    if print_body {
        println!("{}", String::from_utf8_lossy(&response.body));
    }
    Ok(())
}

fn percentile(sorted: &[u64], p: f64) -> f64 {
    let i = ((p / 100.0) * sorted.len() as f64) as usize;
    sorted[i.min(sorted.len() - 1)] as f64 / 1_000.0
}

fn bench(addr: &str, host: &str, path: &str, connections: usize, requests: usize) -> Result<()> {
    eprintln!("bench: {connections} connections x {requests} keep-alive GET {path} to {addr}");
    let start = Instant::now();

    let handles: Vec<_> = (0..connections)
        .map(|_| {
            let addr = addr.to_string();
            let host = host.to_string();
            let path = path.to_string();
            std::thread::spawn(move || -> Result<(Vec<u64>, usize)> {
                let stream = TcpStream::connect(&addr)?;
                stream.set_nodelay(true)?;
                let mut writer = stream.try_clone()?;
                let mut reader = BufReader::new(stream);
                let mut samples = Vec::with_capacity(requests);
                let mut bytes = 0;
                for _ in 0..requests {
                    let sent = Instant::now();
                    send_request(&mut writer, &host, &path, true)?;
                    let response = read_response(&mut reader)?;
                    if response.header("Connection") != Some("keep-alive") {
                        bail!("server dropped keep-alive (status {})", response.status);
                    }
                    samples.push(sent.elapsed().as_nanos() as u64);
                    bytes += response.body.len();
                }
                Ok((samples, bytes))
            })
        })
        .collect();

    let mut all = Vec::with_capacity(connections * requests);
    let mut total_bytes = 0;
    for h in handles {
        match h.join() {
            Ok(Ok((samples, bytes))) => {
                all.extend(samples);
                total_bytes += bytes;
            }
            Ok(Err(e)) => eprintln!("connection failed: {e:#}"),
            Err(_) => eprintln!("connection thread panicked"),
        }
    }

    let elapsed = start.elapsed();
    if all.is_empty() {
        bail!("no requests completed");
    }
    all.sort_unstable();
    report(&all, total_bytes, elapsed);
    Ok(())
}

fn report(sorted: &[u64], bytes: usize, elapsed: Duration) {
    let n = sorted.len();
    let secs = elapsed.as_secs_f64();
    eprintln!("── summary ({secs:.2}s, {n} requests) ──────────────────────────────────");
    eprintln!("  qps     {:.0}", n as f64 / secs);
    eprintln!("  MB/s    {:.1}", bytes as f64 / secs / 1_000_000.0);
    eprintln!("  p50     {:.1}µs", percentile(sorted, 50.0));
    eprintln!("  p95     {:.1}µs", percentile(sorted, 95.0));
    eprintln!("  p99     {:.1}µs", percentile(sorted, 99.0));
    eprintln!("  p99.9   {:.1}µs", percentile(sorted, 99.9));
    eprintln!("  max     {:.1}µs", sorted[n - 1] as f64 / 1_000.0);
}

fn main() -> Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    match args.command.unwrap_or(Command::Get {
        path: "/".to_string(),
        body: false,
    }) {
        Command::Get { path, body } => get(&addr, &args.host, &path, body),
        Command::Bench {
            connections,
            requests,
            path,
        } => bench(&addr, &args.host, &path, connections, requests),
    }
}
