use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Client;

/// Address-keyed cache of consensus clients.
///
/// At most one client exists per address; every observer shares the cached
/// instance. Reads take a shared lock, a write is only taken on first insert.
/// A failed construction leaves the pool untouched so a later call can retry.
pub struct ClientPool {
    timeout: Duration,
    cancel: CancellationToken,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl ClientPool {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            cancel,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the client for `address`, constructing and caching it on
    /// first request.
    pub fn client(&self, address: &str) -> Result<Arc<Client>> {
        if let Some(client) = self.clients.read().get(address) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(Client::new(address, self.timeout, self.cancel.child_token())?);

        let mut clients = self.clients.write();
        // Another caller may have raced the insert; keep the first one.
        let entry = clients
            .entry(address.to_string())
            .or_insert_with(|| {
                debug!(address = %address, "created consensus client");
                client
            });

        Ok(Arc::clone(entry))
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}
