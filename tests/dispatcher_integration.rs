//! Dispatcher driven one `turn` at a time from the test thread, so connection and timer
//! bookkeeping can be inspected between iterations.

mod common;

use std::io::{BufReader, Read, Write};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::TestRoot;
use webreactor::users::{StoreError, UserPool, UserStore};
use webreactor::{signals, Dispatcher};

/// A credential store that answers only after `delay`.
struct SlowStore {
    delay: Duration,
}

impl UserStore for SlowStore {
    fn password_of(&mut self, _name: &str) -> Result<Option<String>, StoreError> {
        thread::sleep(self.delay);
        Ok(None)
    }

    fn insert_user(&mut self, _name: &str, _password: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A credential store that takes the worker task down with it.
struct PanickingStore;

impl UserStore for PanickingStore {
    fn password_of(&mut self, _name: &str) -> Result<Option<String>, StoreError> {
        panic!("credential store crashed");
    }

    fn insert_user(&mut self, _name: &str, _password: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

fn pool_of(store: impl UserStore + 'static) -> Option<Arc<UserPool>> {
    Some(Arc::new(UserPool::new(vec![Box::new(store)])))
}

#[test]
fn connection_over_the_limit_is_rejected_without_registration() {
    let root = TestRoot::new();
    let mut config = common::config(&root);
    config.max_connections = 1;
    let mut server = Dispatcher::new(&config, None).unwrap();
    let addr = server.local_addr();

    let first = common::connect(addr);
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));
    assert_eq!(server.timer_len(), 1);

    let mut second = common::connect(addr);
    let mut busy = Vec::new();
    let reader = thread::spawn(move || {
        second.read_to_end(&mut busy).unwrap();
        busy
    });
    // Turn until the rejected peer has been answered and hung up on.
    for _ in 0..10 {
        server.turn(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(reader.join().unwrap(), b"Server busy!");
    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.timer_len(), 1);

    drop(first);
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 0));
    assert_eq!(server.timer_len(), 0);
}

#[test]
fn idle_connection_is_evicted() {
    let root = TestRoot::new();
    let mut config = common::config(&root);
    config.timeout = Duration::from_millis(100);
    let mut server = Dispatcher::new(&config, None).unwrap();

    let mut idle = common::connect(server.local_addr());
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));

    thread::sleep(Duration::from_millis(150));
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 0));
    assert_eq!(server.timer_len(), 0);

    let mut buf = [0u8; 16];
    assert_eq!(idle.read(&mut buf).unwrap(), 0);
}

#[test]
fn activity_pushes_the_deadline_back() {
    let root = TestRoot::new();
    let mut config = common::config(&root);
    config.timeout = Duration::from_millis(300);
    let mut server = Dispatcher::new(&config, None).unwrap();

    let stream = common::connect(server.local_addr());
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));

    for _ in 0..3 {
        thread::sleep(Duration::from_millis(150));
        writer
            .write_all(common::get_request("/", true).as_bytes())
            .unwrap();
        let done = thread::scope(|s| {
            let client = s.spawn(|| common::read_response(&mut reader).status);
            while !client.is_finished() {
                server.turn(Some(Duration::from_millis(10))).unwrap();
            }
            client.join().unwrap()
        });
        assert_eq!(done, 200);
        assert_eq!(server.connection_count(), 1);
    }
}

#[test]
fn zero_timeout_disables_eviction() {
    let root = TestRoot::new();
    let mut config = common::config(&root);
    config.timeout = Duration::ZERO;
    let mut server = Dispatcher::new(&config, None).unwrap();

    let _idle = common::connect(server.local_addr());
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));
    assert_eq!(server.timer_len(), 0);
    server.turn(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(server.connection_count(), 1);
}

#[test]
fn shutdown_handle_stops_run() {
    let root = TestRoot::new();
    let mut server = Dispatcher::new(&common::config(&root), None).unwrap();
    let handle = server.shutdown_handle();
    let addr = server.local_addr();
    let runner = thread::spawn(move || server.run());

    let resp = common::exchange(addr, &common::get_request("/", false));
    assert_eq!(resp.status, 200);

    handle.shutdown();
    runner.join().unwrap().unwrap();
}

#[test]
fn connection_evicted_while_a_worker_holds_it_is_torn_down_on_return() {
    let root = TestRoot::new();
    let mut config = common::config(&root);
    config.timeout = Duration::from_millis(100);
    let store = SlowStore {
        delay: Duration::from_millis(600),
    };
    let mut server = Dispatcher::new(&config, pool_of(store)).unwrap();

    let mut client = common::connect(server.local_addr());
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));
    client
        .write_all(common::post_form("/login", "username=a&password=b").as_bytes())
        .unwrap();

    // The deadline passes while the task is still stuck in the store: the timer entry
    // goes, the slot stays until the connection comes back.
    let stuck_until = Instant::now() + Duration::from_millis(300);
    while Instant::now() < stuck_until {
        server.turn(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(server.timer_len(), 0);
    assert_eq!(server.connection_count(), 1);

    assert!(common::turn_until(&mut server, |s| s.connection_count() == 0));
    assert_eq!(server.timer_len(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "evicted connection must not be answered");
}

#[test]
fn connection_lost_in_a_panicking_task_is_reclaimed() {
    let root = TestRoot::new();
    let mut server = Dispatcher::new(&common::config(&root), pool_of(PanickingStore)).unwrap();

    let mut client = common::connect(server.local_addr());
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));
    assert_eq!(server.timer_len(), 1);
    client
        .write_all(common::post_form("/login", "username=a&password=b").as_bytes())
        .unwrap();

    assert!(common::turn_until(&mut server, |s| s.connection_count() == 0));
    assert_eq!(server.timer_len(), 0);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    // The slot is free again and the worker survived.
    let _next = common::connect(server.local_addr());
    assert!(common::turn_until(&mut server, |s| s.connection_count() == 1));
}

#[test]
fn termination_signal_stops_run() {
    let root = TestRoot::new();
    let mut server = Dispatcher::new(&common::config(&root), None).unwrap();

    // Masked here and inherited by the listener; the signal below targets that thread
    // alone, so the rest of the test process never sees it.
    signals::block_termination().unwrap();
    let listener = signals::spawn_listener(server.shutdown_handle()).unwrap();
    let rc = unsafe { libc::pthread_kill(listener.as_pthread_t(), libc::SIGTERM) };
    assert_eq!(rc, 0);
    listener.join().unwrap();

    // Already stopped, so this returns without blocking.
    server.run().unwrap();
}
