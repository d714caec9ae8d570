//! Port listeners for incoming streams.

use crate::addr::Addr;
use crate::error::{ErrorCode, Result};
use crate::stream::Stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

struct Binding {
    token: u64,
    queue: mpsc::Sender<Stream>,
}

#[derive(Default)]
struct PortTable {
    bindings: HashMap<u16, Binding>,
    next_token: u64,
}

/// Ports bound on one client, shared with its listeners
#[derive(Clone, Default)]
pub(crate) struct PortMap {
    table: Arc<Mutex<PortTable>>,
}

impl PortMap {
    fn table(&self) -> MutexGuard<'_, PortTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `port` with an accept queue of `queue_len` streams
    pub(crate) fn bind(&self, local: Addr, queue_len: usize) -> Result<Listener> {
        let mut table = self.table();
        if table.bindings.contains_key(&local.port) {
            return Err(ErrorCode::PortOccupied.into());
        }
        let token = table.next_token;
        table.next_token += 1;
        let (queue, rx) = mpsc::channel(queue_len.max(1));
        table.bindings.insert(local.port, Binding { token, queue });
        Ok(Listener {
            addr: local,
            token,
            rx: tokio::sync::Mutex::new(rx),
            ports: self.clone(),
        })
    }

    /// Accept queue for `port`, if bound
    pub(crate) fn queue(&self, port: u16) -> Option<mpsc::Sender<Stream>> {
        self.table().bindings.get(&port).map(|b| b.queue.clone())
    }

    fn release(&self, port: u16, token: u64) {
        let mut table = self.table();
        if table.bindings.get(&port).is_some_and(|b| b.token == token) {
            table.bindings.remove(&port);
        }
    }

    /// Release every port
    pub(crate) fn clear(&self) {
        self.table().bindings.clear();
    }

    pub(crate) fn is_bound(&self, port: u16) -> bool {
        self.table().bindings.contains_key(&port)
    }
}

/// Accepts streams dialed to one port
///
/// Closing or dropping the listener frees the port; streams already queued
/// can still be accepted.
pub struct Listener {
    addr: Addr,
    token: u64,
    rx: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    ports: PortMap,
}

impl Listener {
    /// Address this listener is bound to
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Wait for the next incoming stream
    ///
    /// # Errors
    ///
    /// Returns [`ErrorCode::EntityClosed`] once the listener or its client
    /// is closed and the queue is drained.
    pub async fn accept(&self) -> Result<Stream> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| ErrorCode::EntityClosed.wrap("listener closed"))
    }

    /// Stop accepting and free the port
    pub fn close(&self) {
        self.ports.release(self.addr.port, self.token);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("addr", &self.addr).finish()
    }
}
