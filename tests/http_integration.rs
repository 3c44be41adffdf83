//! End-to-end HTTP over loopback against a dispatcher running on its own thread.

mod common;

use std::io::{BufReader, Read, Write};
use std::time::Duration;

use common::{TestRoot, TestServer};
use webreactor::reactor::TriggerMode;

#[test]
fn serves_index_with_type_and_length() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));

    let resp = common::exchange(server.addr, &common::get_request("/", false));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Type"), Some("text/html"));
    assert_eq!(
        resp.header("Content-Length"),
        Some(common::INDEX_HTML.len().to_string().as_str())
    );
    assert_eq!(resp.header("Connection"), Some("close"));
    assert_eq!(resp.body_str(), common::INDEX_HTML);
}

#[test]
fn missing_file_gets_404_page() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));

    let resp = common::exchange(server.addr, &common::get_request("/nope.html", false));
    assert_eq!(resp.status, 404);
    assert_eq!(resp.body_str(), common::NOT_FOUND_HTML);
}

#[test]
fn garbage_request_line_gets_400_and_close() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));

    let mut stream = common::connect(server.addr);
    stream.write_all(b"NOTAREQUEST\r\n\r\n").unwrap();
    let mut reader = BufReader::new(stream);
    let resp = common::read_response(&mut reader);
    assert_eq!(resp.status, 400);
    assert_eq!(resp.header("Connection"), Some("close"));
    assert_eq!(resp.body_str(), common::BAD_REQUEST_HTML);

    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "server should close after a 400");
}

#[test]
fn keep_alive_serves_several_requests_on_one_socket() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));

    let stream = common::connect(server.addr);
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    for path in ["/", "/style.css", "/index"] {
        writer
            .write_all(common::get_request(path, true).as_bytes())
            .unwrap();
        let resp = common::read_response(&mut reader);
        assert_eq!(resp.status, 200, "{path}");
        assert_eq!(resp.header("Connection"), Some("keep-alive"));
        assert_eq!(resp.header("Keep-Alive"), Some("max=6, timeout=200"));
    }
}

#[test]
fn css_gets_its_content_type() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));
    let resp = common::exchange(server.addr, &common::get_request("/style.css", false));
    assert_eq!(resp.header("Content-Type"), Some("text/css"));
}

#[test]
fn every_trigger_mode_serves_requests() {
    for code in 0..4 {
        let root = TestRoot::new();
        let mut config = common::config(&root);
        config.trigger = TriggerMode::from_code(code);
        let server = TestServer::start(config);

        let resp = common::exchange(server.addr, &common::get_request("/", false));
        assert_eq!(resp.status, 200, "trigmode {code}");
        assert_eq!(resp.body_str(), common::INDEX_HTML);
    }
}

#[test]
fn large_file_survives_partial_writes() {
    let root = TestRoot::new();
    let big: String = (0..200_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    std::fs::write(root.path.join("big.txt"), &big).unwrap();

    for code in [0, 3] {
        let mut config = common::config(&root);
        config.trigger = TriggerMode::from_code(code);
        let server = TestServer::start(config);

        let mut stream = common::connect(server.addr);
        stream
            .write_all(common::get_request("/big.txt", false).as_bytes())
            .unwrap();
        // Let the socket buffer fill so the server has to come back for more.
        std::thread::sleep(Duration::from_millis(50));
        let resp = common::read_response(&mut BufReader::new(stream));
        assert_eq!(resp.status, 200);
        assert_eq!(resp.header("Content-Type"), Some("text/plain"));
        assert_eq!(resp.body.len(), big.len());
        assert!(resp.body == big.as_bytes());
    }
}

#[test]
fn register_then_login() {
    let root = TestRoot::new();
    let server = TestServer::start(common::config(&root));
    let creds = "username=alice&password=s3cret";

    let resp = common::exchange(server.addr, &common::post_form("/register", creds));
    assert_eq!(resp.body_str(), common::WELCOME_HTML);

    let resp = common::exchange(server.addr, &common::post_form("/register", creds));
    assert_eq!(resp.body_str(), common::ERROR_HTML, "duplicate registration");

    let resp = common::exchange(server.addr, &common::post_form("/login", creds));
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body_str(), common::WELCOME_HTML);

    let resp = common::exchange(
        server.addr,
        &common::post_form("/login", "username=alice&password=wrong"),
    );
    assert_eq!(resp.body_str(), common::ERROR_HTML);
}

#[test]
fn login_without_store_fails_closed() {
    let root = TestRoot::new();
    let server = TestServer::start_with_users(common::config(&root), None);
    let resp = common::exchange(
        server.addr,
        &common::post_form("/login", "username=a&password=b"),
    );
    assert_eq!(resp.body_str(), common::ERROR_HTML);
}
