//! Hot-reload plumbing: the live config pointer and the file watcher.
//!
//! The handle owns the current configuration behind an [`ArcSwap`] so readers
//! never block, and a one-slot notification channel toward the server loop.
//! A change event re-reads and re-validates the file; on failure the previous
//! configuration stays live and the event is dropped.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::error::ConfigError;
use super::loader;
use super::schema::GatewayConfig;

/// Owns the live configuration and its file watcher.
pub struct ReloadHandle {
    path: PathBuf,
    current: ArcSwap<GatewayConfig>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ReloadHandle {
    /// Wrap an already-loaded configuration.
    pub fn new(path: PathBuf, initial: GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            path,
            current: ArcSwap::from_pointee(initial),
            watcher: Mutex::new(None),
        })
    }

    /// The configuration requests started now will see.
    pub fn current(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Re-read and validate the file; on success the new configuration is
    /// published atomically and returned.
    pub fn reload(&self) -> Result<Arc<GatewayConfig>, ConfigError> {
        let config = Arc::new(loader::load(&self.path)?);
        self.current.store(Arc::clone(&config));
        Ok(config)
    }

    /// Start watching the config file. Returns the reload signal receiver;
    /// the channel holds at most one pending signal, so bursts of writes
    /// collapse into a single reload.
    pub fn watch(self: &Arc<Self>) -> Result<mpsc::Receiver<()>, notify::Error> {
        let (tx, rx) = mpsc::channel(1);
        let handle = Arc::downgrade(self);
        let mut watcher =
            notify::recommended_watcher(move |event: Result<Event, notify::Error>| {
                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        warn!(%error, "config watcher error");
                        return;
                    }
                };
                // Editors replace files as often as they write them in place.
                if !event.kind.is_modify() && !event.kind.is_create() {
                    return;
                }
                let Some(handle) = handle.upgrade() else {
                    return;
                };
                match handle.reload() {
                    Ok(_) => {
                        info!("configuration change accepted");
                        let _ = tx.try_send(());
                    }
                    Err(error) => {
                        warn!(%error, "config reload failed, keeping previous configuration");
                    }
                }
            })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);
        Ok(rx)
    }
}
