//! Listener Registry (C4): discovery, hot reload, and enablement bookkeeping
//! for declarative rule files under the listeners directory

mod module;

pub use module::{Action, Condition, EventKind, ListenerConfig, ListenerModule, is_candidate_file, load_module};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::errors::AppResult;

/// Aggregate counts surfaced to `GET /api/listeners` (spec.md §4.4 `stats()`)
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub enabled: usize,
    pub by_event: HashMap<String, usize>,
}

/// Holds the active set of enabled listener modules plus the full config
/// list (enabled and disabled) for UI listing
pub struct ListenerRegistry {
    directory: PathBuf,
    active: RwLock<Vec<ListenerModule>>,
    all_configs: RwLock<Vec<ListenerConfig>>,
}

impl ListenerRegistry {
    pub fn new(directory: PathBuf) -> Self {
        Self {
            directory,
            active: RwLock::new(Vec::new()),
            all_configs: RwLock::new(Vec::new()),
        }
    }

    /// Clear the active set, scan the directory, and register every file
    /// whose `config` and `then` parse successfully and whose `enabled` is
    /// true (spec.md §4.4 "Load rules"). Disabled listeners are still kept
    /// for the "all listeners" UI view but never dispatched.
    pub fn load_all(&self) -> AppResult<()> {
        std::fs::create_dir_all(&self.directory).ok();

        let mut active = Vec::new();
        let mut all_configs = Vec::new();

        let entries = std::fs::read_dir(&self.directory).map_err(|e| {
            crate::errors::AppError::InvalidInput(format!(
                "cannot read listeners directory {:?}: {e}",
                self.directory
            ))
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || !is_candidate_file(&path) {
                continue;
            }
            match load_module(&path) {
                Ok(module) => {
                    all_configs.push(module.config.clone());
                    if module.config.enabled {
                        active.push(module);
                    }
                }
                Err(err) => {
                    warn!(file = ?path, error = %err, "failed to load listener file, skipping");
                }
            }
        }

        info!(count = active.len(), "listener registry reloaded");
        *self.active.write().expect("registry lock poisoned") = active;
        *self.all_configs.write().expect("registry lock poisoned") = all_configs;
        Ok(())
    }

    /// Modules currently eligible for dispatch, matching `event`
    pub fn matching(&self, event: EventKind) -> Vec<ListenerModule> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .iter()
            .filter(|m| m.config.event == event)
            .cloned()
            .collect()
    }

    /// Every known config, enabled or not (spec.md §4.4 `getAll()`)
    pub fn get_all(&self) -> Vec<ListenerConfig> {
        self.all_configs.read().expect("registry lock poisoned").clone()
    }

    /// A single active module by id (spec.md §4.4 `get(id)`)
    pub fn get(&self, id: &str) -> Option<ListenerModule> {
        self.active
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|m| m.config.id == id)
            .cloned()
    }

    pub fn stats(&self) -> RegistryStats {
        let configs = self.all_configs.read().expect("registry lock poisoned");
        let mut by_event: HashMap<String, usize> = HashMap::new();
        let mut enabled = 0;
        for config in configs.iter() {
            if config.enabled {
                enabled += 1;
            }
            *by_event
                .entry(format!("{:?}", config.event))
                .or_insert(0) += 1;
        }
        RegistryStats {
            total: configs.len(),
            enabled,
            by_event,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Spawn a directory watcher that reloads the registry on every filesystem
/// event (spec.md §4.4 "Hot reload"). Idempotent at the call site: callers
/// should only invoke this once per registry, per spec.md's "starting a
/// second watcher is a no-op".
///
/// Returns the live `RecommendedWatcher`; dropping it stops the watch.
pub fn spawn_watcher(
    registry: std::sync::Arc<ListenerRegistry>,
    on_reload: mpsc::Sender<Vec<ListenerConfig>>,
) -> AppResult<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
        if let Ok(event) = event {
            let _ = tx.send(event);
        }
    })
    .map_err(|e| crate::errors::AppError::Internal(format!("failed to start file watcher: {e}")))?;

    watcher
        .watch(registry.directory(), RecursiveMode::NonRecursive)
        .map_err(|e| crate::errors::AppError::Internal(format!("failed to watch directory: {e}")))?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if let Err(err) = registry.load_all() {
                warn!(error = %err, "hot reload failed");
                continue;
            }
            let _ = on_reload.send(registry.get_all()).await;
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_listener(dir: &Path, filename: &str, contents: &str) {
        let mut file = std::fs::File::create(dir.join(filename)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn load_all_registers_only_enabled_listeners() {
        let dir = tempfile::tempdir().unwrap();
        write_listener(
            dir.path(),
            "enabled.yaml",
            "id: a\nname: A\nevent: email_received\nenabled: true\nthen: []\n",
        );
        write_listener(
            dir.path(),
            "disabled.yaml",
            "id: b\nname: B\nevent: email_received\nenabled: false\nthen: []\n",
        );
        write_listener(dir.path(), "_ignored.yaml", "not valid yaml: [");

        let registry = ListenerRegistry::new(dir.path().to_path_buf());
        registry.load_all().unwrap();

        assert_eq!(registry.matching(EventKind::EmailReceived).len(), 1);
        assert_eq!(registry.get_all().len(), 2);

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
    }

    #[test]
    fn reload_reflects_file_removal() {
        let dir = tempfile::tempdir().unwrap();
        write_listener(
            dir.path(),
            "a.yaml",
            "id: a\nname: A\nevent: email_received\nthen: []\n",
        );
        let registry = ListenerRegistry::new(dir.path().to_path_buf());
        registry.load_all().unwrap();
        assert_eq!(registry.get_all().len(), 1);

        std::fs::remove_file(dir.path().join("a.yaml")).unwrap();
        registry.load_all().unwrap();
        assert_eq!(registry.get_all().len(), 0);
    }
}
