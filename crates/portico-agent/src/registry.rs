//! Connection registry: reconnection tokens to live connections.
//!
//! Two keyed tables, one per connection flavor. The registry owns the
//! uniqueness invariants: a fresh connect on a present token is an
//! error, a resume on an absent token is an error, and entries only
//! leave the maps on terminal close (connection actors report that
//! through the cleanup channel; a registry task applies the removals and
//! publishes events the idle supervisor observes).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use portico_core::error::{Error, Result};

use crate::connection::ManagementConnection;
use crate::exthost::ExtensionHostConnection;

/// Cleanup requests sent by connection actors on terminal close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCommand {
    RemoveManagement(String),
    RemoveExtensionHost(String),
}

/// Registry changes the idle supervisor subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ExtensionHostOpened { token: String },
    ExtensionHostClosed { token: String, remaining: usize },
}

#[derive(Default)]
struct Maps {
    mgmt: HashMap<String, Arc<ManagementConnection>>,
    xhost: HashMap<String, Arc<ExtensionHostConnection>>,
    /// Tokens with an extension-host spawn in flight; they count as taken
    /// so the duplicate check stays atomic across the spawn await.
    xhost_pending: HashSet<String>,
}

struct Shared {
    maps: Mutex<Maps>,
    events_tx: broadcast::Sender<RegistryEvent>,
}

/// The two token-keyed connection tables.
pub struct ConnectionRegistry {
    shared: Arc<Shared>,
    cleanup_tx: mpsc::UnboundedSender<RegistryCommand>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        let (cleanup_tx, cleanup_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            maps: Mutex::new(Maps::default()),
            events_tx,
        });

        tokio::spawn(run_cleanup(Arc::clone(&shared), cleanup_rx));

        Arc::new(Self { shared, cleanup_tx })
    }

    /// Sender that connection actors use to report terminal close.
    pub fn cleanup_handle(&self) -> mpsc::UnboundedSender<RegistryCommand> {
        self.cleanup_tx.clone()
    }

    /// Subscribe to registry events (extension-host opens/closes).
    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Insert a fresh management connection. Fails on a token collision
    /// without touching the existing entry.
    pub fn insert_management(&self, conn: Arc<ManagementConnection>) -> Result<()> {
        let mut maps = self.lock_maps();
        let token = conn.token().to_string();
        if maps.mgmt.contains_key(&token) {
            return Err(Error::DuplicateToken(token));
        }
        debug!(token, "management connection registered");
        maps.mgmt.insert(token, conn);
        Ok(())
    }

    /// Look up a management connection for a resume.
    pub fn resume_management(&self, token: &str) -> Result<Arc<ManagementConnection>> {
        self.lock_maps()
            .mgmt
            .get(token)
            .cloned()
            .ok_or_else(|| Error::UnknownToken(token.to_string()))
    }

    /// Reserve an extension-host token ahead of the worker spawn. The
    /// reservation is released by committing or dropping the slot.
    pub fn begin_extension_host(self: &Arc<Self>, token: &str) -> Result<ExtensionHostSlot> {
        let mut maps = self.lock_maps();
        if maps.xhost.contains_key(token) || maps.xhost_pending.contains(token) {
            return Err(Error::DuplicateToken(token.to_string()));
        }
        maps.xhost_pending.insert(token.to_string());
        Ok(ExtensionHostSlot {
            token: token.to_string(),
            shared: Arc::clone(&self.shared),
            committed: false,
        })
    }

    /// Look up an extension-host connection for a resume.
    pub fn resume_extension_host(&self, token: &str) -> Result<Arc<ExtensionHostConnection>> {
        self.lock_maps()
            .xhost
            .get(token)
            .cloned()
            .ok_or_else(|| Error::UnknownToken(token.to_string()))
    }

    /// Number of live extension-host connections.
    pub fn extension_host_count(&self) -> usize {
        self.lock_maps().xhost.len()
    }

    /// Number of live management connections.
    pub fn management_count(&self) -> usize {
        self.lock_maps().mgmt.len()
    }

    fn lock_maps(&self) -> std::sync::MutexGuard<'_, Maps> {
        lock(&self.shared.maps)
    }
}

/// Reservation for an in-flight extension-host spawn.
pub struct ExtensionHostSlot {
    token: String,
    shared: Arc<Shared>,
    committed: bool,
}

impl ExtensionHostSlot {
    /// Promote the reservation to a live entry and announce it.
    pub fn commit(mut self, conn: Arc<ExtensionHostConnection>) {
        let mut maps = lock(&self.shared.maps);
        maps.xhost_pending.remove(&self.token);
        maps.xhost.insert(self.token.clone(), conn);
        drop(maps);
        self.committed = true;
        debug!(token = self.token, "extension host connection registered");
        let _ = self
            .shared
            .events_tx
            .send(RegistryEvent::ExtensionHostOpened {
                token: self.token.clone(),
            });
    }
}

impl Drop for ExtensionHostSlot {
    fn drop(&mut self) {
        if !self.committed {
            lock(&self.shared.maps).xhost_pending.remove(&self.token);
        }
    }
}

fn lock(maps: &Mutex<Maps>) -> std::sync::MutexGuard<'_, Maps> {
    match maps.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_cleanup(shared: Arc<Shared>, mut cleanup_rx: mpsc::UnboundedReceiver<RegistryCommand>) {
    while let Some(cmd) = cleanup_rx.recv().await {
        match cmd {
            RegistryCommand::RemoveManagement(token) => {
                if lock(&shared.maps).mgmt.remove(&token).is_none() {
                    warn!(token, "removal for unknown management token");
                } else {
                    debug!(token, "management connection removed");
                }
            }
            RegistryCommand::RemoveExtensionHost(token) => {
                let remaining = {
                    let mut maps = lock(&shared.maps);
                    if maps.xhost.remove(&token).is_none() {
                        warn!(token, "removal for unknown extension host token");
                        continue;
                    }
                    maps.xhost.len()
                };
                debug!(token, remaining, "extension host connection removed");
                let _ = shared
                    .events_tx
                    .send(RegistryEvent::ExtensionHostClosed { token, remaining });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mgmt_conn(registry: &ConnectionRegistry, token: &str) -> Arc<ManagementConnection> {
        let (conn, run) = ManagementConnection::new(
            token.to_string(),
            Duration::from_secs(60),
            registry.cleanup_handle(),
        );
        tokio::spawn(run);
        conn
    }

    #[tokio::test]
    async fn duplicate_management_token_is_rejected_and_original_kept() {
        let registry = ConnectionRegistry::new();
        let first = mgmt_conn(&registry, "abc");
        registry.insert_management(first.clone()).unwrap();

        let second = mgmt_conn(&registry, "abc");
        let err = registry.insert_management(second).unwrap_err();
        assert!(matches!(err, Error::DuplicateToken(t) if t == "abc"));

        // The original entry is untouched and still resumable.
        let resumed = registry.resume_management("abc").unwrap();
        assert!(Arc::ptr_eq(&resumed, &first));
    }

    #[tokio::test]
    async fn resume_unknown_token_fails() {
        let registry = ConnectionRegistry::new();
        let err = registry.resume_management("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownToken(t) if t == "nope"));
        let err = registry.resume_extension_host("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownToken(_)));
    }

    #[tokio::test]
    async fn close_removes_entry_and_later_resume_fails() {
        let registry = ConnectionRegistry::new();
        let conn = mgmt_conn(&registry, "abc");
        registry.insert_management(conn.clone()).unwrap();
        assert_eq!(registry.management_count(), 1);

        let mut closed = conn.on_close();
        conn.close();
        closed.recv().await.unwrap();
        // Give the cleanup task a beat to apply the removal.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(registry.management_count(), 0);
        assert!(registry.resume_management("abc").is_err());
    }

    #[tokio::test]
    async fn pending_reservation_blocks_duplicates_until_dropped() {
        let registry = ConnectionRegistry::new();
        let slot = registry.begin_extension_host("xh").unwrap();

        assert!(matches!(
            registry.begin_extension_host("xh"),
            Err(Error::DuplicateToken(_))
        ));
        // Pending tokens are not resumable.
        assert!(registry.resume_extension_host("xh").is_err());

        drop(slot);
        assert!(registry.begin_extension_host("xh").is_ok());
    }

    #[tokio::test]
    async fn same_token_may_exist_in_both_flavors() {
        let registry = ConnectionRegistry::new();
        let conn = mgmt_conn(&registry, "shared");
        registry.insert_management(conn).unwrap();
        // The extension-host namespace is independent.
        assert!(registry.begin_extension_host("shared").is_ok());
    }
}
