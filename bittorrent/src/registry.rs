//! Process-wide name registry (§9 "Named lookup"): a concurrent map from
//! info-hash to a torrent's command sender, with a single writer per key
//! (the owning `Torrent` at registration time) and a guard that
//! deregisters on drop.

use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use crate::{torrent::TorrentTx, InfoHash};

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<InfoHash, TorrentTx>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tx` under `info_hash`. The returned guard deregisters the
    /// entry when dropped, so a torrent's lookup entry cannot outlive it.
    pub async fn register(&self, info_hash: InfoHash, tx: TorrentTx) -> RegistryGuard {
        self.inner.write().await.insert(info_hash, tx);
        RegistryGuard { registry: self.clone(), info_hash }
    }

    pub async fn lookup(&self, info_hash: &InfoHash) -> Option<TorrentTx> {
        self.inner.read().await.get(info_hash).cloned()
    }
}

pub struct RegistryGuard {
    registry: Registry,
    info_hash: InfoHash,
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let info_hash = self.info_hash;
        // Drop can't be async. A registration for the same info-hash
        // created after this guard (e.g. a quick deactivate/reactivate)
        // would already have overwritten our entry, so only remove it if
        // it's still the one we own.
        let owned_tx = registry.inner.try_read().ok().and_then(|m| m.get(&info_hash).cloned());
        tokio::spawn(async move {
            let mut map = registry.inner.write().await;
            if let (Some(current), Some(owned)) = (map.get(&info_hash), owned_tx.as_ref()) {
                if current.same_channel(owned) {
                    map.remove(&info_hash);
                }
            }
        });
    }
}
