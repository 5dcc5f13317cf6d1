//! Cluster directory
//!
//! Read-only view of project ownership: for each project id, the address of
//! the node currently holding its on-disk data. Ownership is assigned by an
//! external membership service (seeded from configuration here); this
//! module only discovers the owner, it never elects one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("ownership of project {0} is not known yet")]
    NotReady(u64),
}

#[derive(Clone)]
pub struct ClusterDirectory {
    local_address: String,
    credential: String,
    owners: Arc<RwLock<HashMap<u64, String>>>,
    changed: Arc<Notify>,
    wait_timeout: Duration,
}

impl ClusterDirectory {
    pub fn new(
        local_address: String,
        credential: String,
        owners: HashMap<u64, String>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            local_address,
            credential,
            owners: Arc::new(RwLock::new(owners)),
            changed: Arc::new(Notify::new()),
            wait_timeout,
        }
    }

    /// Address of this node, as peers reach it.
    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// The shared bearer token for node-to-node calls. Never handed to end
    /// users.
    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn is_local(&self, address: &str) -> bool {
        self.local_address == address
    }

    /// Record an ownership assignment (membership updates, tests).
    pub fn assign(&self, project_id: u64, address: String) {
        self.owners
            .write()
            .expect("ownership table poisoned")
            .insert(project_id, address);
        self.changed.notify_waiters();
    }

    fn lookup(&self, project_id: u64) -> Option<String> {
        self.owners
            .read()
            .expect("ownership table poisoned")
            .get(&project_id)
            .cloned()
    }

    /// Resolve the owning node for a project. With `wait` set, blocks
    /// (bounded) while ownership is transiently unknown; otherwise fails
    /// immediately.
    pub async fn active_node_for(
        &self,
        project_id: u64,
        wait: bool,
    ) -> Result<String, DirectoryError> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            // Register for change notification before checking, so an
            // assignment between check and wait is not missed.
            let changed = self.changed.notified();
            if let Some(address) = self.lookup(project_id) {
                return Ok(address);
            }
            if !wait {
                return Err(DirectoryError::NotReady(project_id));
            }
            if timeout_at(deadline, changed).await.is_err() {
                return Err(DirectoryError::NotReady(project_id));
            }
        }
    }

    /// Base URL of a node's internal HTTP interface.
    pub fn server_url(&self, address: &str) -> String {
        format!("http://{address}")
    }
}
