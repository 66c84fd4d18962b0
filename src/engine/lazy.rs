//! Lazy Connection
//!
//! Remote engines hold a connector instead of a live client and only dial
//! the server on the first operation that needs it. An I/O error drops the
//! client so the next operation dials again.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};

type ConnectFn<C> = Box<dyn Fn() -> Result<C> + Send + Sync>;

// == Connector ==
/// A client slot filled on first use.
pub struct Connector<C> {
    name: &'static str,
    connect: ConnectFn<C>,
    client: Mutex<Option<C>>,
}

impl<C: Send> Connector<C> {
    /// Wraps a connect function that is not called until needed.
    pub fn new<F>(name: &'static str, connect: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
    {
        Self {
            name,
            connect: Box::new(connect),
            client: Mutex::new(None),
        }
    }

    /// Wraps an already connected client.
    pub fn ready(name: &'static str, client: C) -> Self {
        Self {
            name,
            connect: Box::new(move || {
                Err(CacheError::Storage(format!("{} client cannot reconnect", name)))
            }),
            client: Mutex::new(Some(client)),
        }
    }

    /// Runs `operation` against the client, connecting first if needed.
    pub fn with<T>(&self, operation: impl FnOnce(&mut C) -> Result<T>) -> Result<T> {
        let mut slot = self.client.lock();

        let client = match &mut *slot {
            Some(client) => client,
            empty => {
                debug!("[{}] Connecting", self.name);
                let client = (self.connect)().map_err(|e| {
                    warn!("[{}] Connection failed: {}", self.name, e);
                    CacheError::Storage(format!("{} connection failed: {}", self.name, e))
                })?;
                empty.insert(client)
            }
        };

        let result = operation(client);
        if let Err(CacheError::Io(e)) = &result {
            warn!("[{}] Connection lost, reconnecting on next use: {}", self.name, e);
            *slot = None;
        }
        result
    }

    /// Whether a client has been established.
    pub fn is_connected(&self) -> bool {
        self.client.lock().is_some()
    }
}

impl<C> fmt::Debug for Connector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("connected", &self.client.lock().is_some())
            .finish()
    }
}
