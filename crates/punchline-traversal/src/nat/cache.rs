//! Per-interface NAT classification cache.

use crate::error::Result;
use crate::nat::classifier::NatDetector;
use crate::nat::types::NatInfo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Classification results keyed by interface name.
///
/// Entries are immutable once stored; [`NatCache::refresh`] replaces one
/// with a fresh classification.
#[derive(Default)]
pub struct NatCache {
    detectors: RwLock<HashMap<String, Arc<dyn NatDetector>>>,
    entries: RwLock<HashMap<String, NatInfo>>,
}

impl NatCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the detector used for `interface`.
    pub async fn register(&self, interface: &str, detector: Arc<dyn NatDetector>) {
        self.detectors
            .write()
            .await
            .insert(interface.to_string(), detector);
    }

    /// Store a known classification.
    pub async fn insert(&self, interface: &str, info: NatInfo) {
        self.entries.write().await.insert(interface.to_string(), info);
    }

    /// Cached classification, if any.
    pub async fn get(&self, interface: &str) -> Option<NatInfo> {
        self.entries.read().await.get(interface).copied()
    }

    /// Cached classification, or classify and store.
    ///
    /// Interfaces without a detector get the default (port restricted,
    /// random delta) without being cached.
    ///
    /// # Errors
    ///
    /// Propagates the detector's error.
    pub async fn get_or_detect(&self, interface: &str) -> Result<NatInfo> {
        if let Some(info) = self.get(interface).await {
            return Ok(info);
        }
        self.refresh(interface).await
    }

    /// Classify `interface` again and replace the cached entry.
    ///
    /// # Errors
    ///
    /// Propagates the detector's error; the old entry is kept on failure.
    pub async fn refresh(&self, interface: &str) -> Result<NatInfo> {
        let detector = self.detectors.read().await.get(interface).cloned();
        let Some(detector) = detector else {
            debug!("No NAT detector for {}, assuming default", interface);
            return Ok(NatInfo::default());
        };

        let info = detector.detect().await?;
        debug!("NAT for interface {}: {}", interface, info);
        self.insert(interface, info).await;
        Ok(info)
    }

    /// Forget the entry for `interface`.
    pub async fn invalidate(&self, interface: &str) {
        self.entries.write().await.remove(interface);
    }
}
