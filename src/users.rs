//! Credential store used by the login and registration pages.
//!
//! A `UserPool` hands out a fixed number of `UserStore` handles. `acquire` blocks while
//! every handle is checked out and returns `None` once the pool is closed; the returned
//! guard puts the handle back when dropped.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user table is unavailable")]
    Unavailable,
    #[error("user `{0}` already exists")]
    Duplicate(String),
}

/// One handle onto the user table. Lookups and inserts take their arguments as
/// parameters; nothing is ever spliced into a query string.
pub trait UserStore: Send {
    fn password_of(&mut self, name: &str) -> Result<Option<String>, StoreError>;
    fn insert_user(&mut self, name: &str, password: &str) -> Result<(), StoreError>;
}

/// Handles sharing one in-process table.
#[derive(Clone, Default)]
pub struct MemoryUserStore {
    table: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UserStore for MemoryUserStore {
    fn password_of(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.table().get(name).cloned())
    }

    fn insert_user(&mut self, name: &str, password: &str) -> Result<(), StoreError> {
        let mut table = self.table();
        if table.contains_key(name) {
            return Err(StoreError::Duplicate(name.to_string()));
        }
        table.insert(name.to_string(), password.to_string());
        Ok(())
    }
}

/// Which form the credentials came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Login,
    Register,
}

struct PoolState {
    idle: VecDeque<Box<dyn UserStore>>,
    closed: bool,
}

pub struct UserPool {
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
}

impl UserPool {
    pub fn new(handles: Vec<Box<dyn UserStore>>) -> Self {
        let size = handles.len();
        Self {
            state: Mutex::new(PoolState {
                idle: handles.into(),
                closed: false,
            }),
            available: Condvar::new(),
            size,
        }
    }

    /// `size` handles onto one fresh in-memory table.
    pub fn in_memory(size: usize) -> Self {
        let store = MemoryUserStore::new();
        let handles = (0..size.max(1))
            .map(|_| Box::new(store.clone()) as Box<dyn UserStore>)
            .collect();
        Self::new(handles)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn acquire(&self) -> Option<PooledUser<'_>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(handle) = state.idle.pop_front() {
                return Some(PooledUser {
                    pool: self,
                    handle: Some(handle),
                });
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Return a handle. Handles released after `close` are dropped.
    pub fn release(&self, handle: Box<dyn UserStore>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.idle.push_back(handle);
        drop(state);
        self.available.notify_one();
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.idle.clear();
        drop(state);
        self.available.notify_all();
    }

    /// Check a login or create a registration. Empty fields, a closed pool and store
    /// errors all count as failure.
    pub fn verify(&self, name: &str, password: &str, access: Access) -> bool {
        if name.is_empty() || password.is_empty() {
            return false;
        }
        let Some(mut conn) = self.acquire() else {
            error!("no credential store handle available");
            return false;
        };

        let outcome = match conn.password_of(name) {
            Ok(Some(stored)) => match access {
                Access::Login => Ok(stored == password),
                Access::Register => Ok(false),
            },
            Ok(None) => match access {
                Access::Login => Ok(false),
                Access::Register => conn.insert_user(name, password).map(|()| true),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok(ok) => {
                debug!(user = name, ?access, ok, "credential check");
                ok
            }
            Err(e) => {
                error!(user = name, ?access, "credential store error: {e}");
                false
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out handle; returned to its pool on drop.
pub struct PooledUser<'a> {
    pool: &'a UserPool,
    handle: Option<Box<dyn UserStore>>,
}

impl Deref for PooledUser<'_> {
    type Target = dyn UserStore;

    fn deref(&self) -> &Self::Target {
        self.handle.as_deref().expect("handle present until drop")
    }
}

impl DerefMut for PooledUser<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.handle.as_deref_mut().expect("handle present until drop")
    }
}

impl Drop for PooledUser<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}
