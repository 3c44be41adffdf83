use std::hint::black_box;
use std::time::{Duration, Instant};

use webreactor::buffer::ByteBuffer;
use webreactor::request::{ParseStatus, RequestParser, decode_form};

const TARGET_DURATION: Duration = Duration::from_secs(2);

const GET: &[u8] = b"GET /picture HTTP/1.1\r\nHost: localhost:5678\r\nUser-Agent: bench/1.0\r\nAccept: text/html,application/xhtml+xml\r\nAccept-Encoding: gzip, deflate\r\nConnection: keep-alive\r\n\r\n";

fn bench_get() {
    let mut parser = RequestParser::new();
    let mut buf = ByteBuffer::new();

    for _ in 0..10_000 {
        buf.append(GET);
        let _ = parser.parse(&mut buf, None);
        parser.reset();
    }

    let start = Instant::now();
    let mut iterations: u64 = 0;
    while start.elapsed() < TARGET_DURATION {
        buf.append(black_box(GET));
        let status = parser.parse(&mut buf, None).expect("valid request");
        assert_eq!(status, ParseStatus::Complete);
        black_box(parser.path());
        parser.reset();
        iterations += 1;
    }
    let elapsed = start.elapsed();
    eprintln!(
        "parse GET ({} B): {} iters in {:.2}s = {:.1} ns/request",
        GET.len(),
        iterations,
        elapsed.as_secs_f64(),
        elapsed.as_nanos() as f64 / iterations as f64
    );
}

fn bench_form_decode() {
    let body = "username=some+user%40example.com&password=p%40ss+w%26rd&remember=on&note=%E4%BD%A0%E5%A5%BD";
    let start = Instant::now();
    let mut iterations: u64 = 0;
    while start.elapsed() < TARGET_DURATION {
        black_box(decode_form(black_box(body)));
        iterations += 1;
    }
    let elapsed = start.elapsed();
    eprintln!(
        "decode_form ({} B): {:.1} ns/body",
        body.len(),
        elapsed.as_nanos() as f64 / iterations as f64
    );
}

fn main() {
    bench_get();
    bench_form_decode();
}
