//! SIGINT/SIGTERM as a graceful stop.
//!
//! `block_termination` masks both signals in the calling thread, and every thread it
//! spawns afterwards inherits the mask, so call it before the dispatcher starts its
//! workers. `spawn_listener` then parks one thread in `sigwait` and turns the first
//! signal into a `ShutdownHandle::shutdown`.

use std::io;
use std::mem::MaybeUninit;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::dispatcher::ShutdownHandle;

fn termination_set() -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), libc::SIGINT);
        libc::sigaddset(set.as_mut_ptr(), libc::SIGTERM);
        set.assume_init()
    }
}

/// Block SIGINT and SIGTERM in the calling thread and its future children.
pub fn block_termination() -> io::Result<()> {
    let set = termination_set();
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM on a dedicated thread and stop the dispatcher behind
/// `handle` when one arrives. The caller must have run `block_termination` first.
pub fn spawn_listener(handle: ShutdownHandle) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            let set = termination_set();
            let mut signal: libc::c_int = 0;
            let rc = unsafe { libc::sigwait(&set, &mut signal) };
            if rc != 0 {
                warn!("sigwait failed: {}", io::Error::from_raw_os_error(rc));
                return;
            }
            info!(signal, "termination signal, shutting down");
            handle.shutdown();
        })
}
