use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::allocator::PortAllocator;
use crate::config::EmulatorSettings;
use crate::emulator::{Emulator, EmulatorConfig, Endpoints, LaunchError, TeardownError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of emulators reached")]
    CapacityExceeded,
    #[error(transparent)]
    Launch(#[from] LaunchError),
}

/// Outcome of a liveness refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// The instance had died and has been removed.
    Dead,
    Unknown,
}

/// Process-wide map of live emulator instances.
///
/// Cheap to clone; clones share the same map. The size never exceeds the
/// limit because the check and the insert happen under one write lock.
#[derive(Clone)]
pub struct EmulatorRegistry {
    inner: Arc<RwLock<HashMap<Uuid, Arc<Emulator>>>>,
    limit: usize,
    allocator: PortAllocator,
    settings: Arc<EmulatorSettings>,
}

impl EmulatorRegistry {
    pub fn new(limit: usize, allocator: PortAllocator, settings: Arc<EmulatorSettings>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            limit,
            allocator,
            settings,
        }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }

    pub fn settings(&self) -> &Arc<EmulatorSettings> {
        &self.settings
    }

    /// Whether another instance would fit right now.
    pub fn has_capacity(&self) -> bool {
        self.len() < self.limit
    }

    /// Register and provision a new instance.
    ///
    /// The instance is registered before it boots, so launches in flight
    /// count against the limit. If provisioning fails the instance is removed
    /// and torn down before the error is returned. If the returned future is
    /// dropped mid-boot, teardown is handed to a background task.
    pub async fn create(&self, config: EmulatorConfig) -> Result<(Uuid, Endpoints), RegistryError> {
        let emulator = Arc::new(Emulator::new(
            config,
            Arc::clone(&self.settings),
            self.allocator.clone(),
        ));
        let id = self.insert(Arc::clone(&emulator))?;
        let mut guard = LaunchGuard {
            registry: self.clone(),
            id,
            armed: true,
        };

        let result = emulator.provision().await;
        guard.armed = false;
        match result {
            Ok(endpoints) => {
                tracing::info!(emulator = %id, ?endpoints, "emulator launched");
                Ok((id, endpoints))
            }
            Err(e) => {
                tracing::warn!(emulator = %id, error = %e, "launch failed, tearing down");
                if let Err(teardown) = self.remove(id).await {
                    tracing::error!(emulator = %id, error = %teardown, "cleanup after failed launch failed");
                }
                Err(e.into())
            }
        }
    }

    /// Register an instance, rejecting it if the registry is full.
    pub fn insert(&self, emulator: Arc<Emulator>) -> Result<Uuid, RegistryError> {
        let mut inner = self.inner.write();
        if inner.len() >= self.limit {
            return Err(RegistryError::CapacityExceeded);
        }
        let id = emulator.id();
        inner.insert(id, emulator);
        Ok(id)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Emulator>> {
        self.inner.read().get(&id).cloned()
    }

    /// Remove an instance and tear it down.
    ///
    /// Returns `Ok(false)` if the id is unknown. When several callers race,
    /// only the one that takes the entry out of the map runs the teardown.
    pub async fn remove(&self, id: Uuid) -> Result<bool, TeardownError> {
        let removed = self.inner.write().remove(&id);
        match removed {
            Some(emulator) => {
                emulator.terminate().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Refresh an instance's liveness timestamp if it is still running.
    /// A dead instance is removed.
    pub async fn touch(&self, id: Uuid) -> Liveness {
        let Some(emulator) = self.get(id) else {
            return Liveness::Unknown;
        };
        if emulator.is_alive().await {
            emulator.mark_alive();
            return Liveness::Alive;
        }
        tracing::info!(emulator = %id, "emulator died, removing");
        if let Err(e) = self.remove(id).await {
            tracing::error!(emulator = %id, error = %e, "failed to tear down dead emulator");
        }
        Liveness::Dead
    }

    /// Ids of instances not seen alive for longer than `threshold`.
    pub fn idle_ids(&self, threshold: Duration) -> Vec<Uuid> {
        self.inner
            .read()
            .iter()
            .filter(|(_, emulator)| emulator.idle_for() > threshold)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and tear down every instance concurrently.
    pub async fn drain(&self) {
        let drained: Vec<Arc<Emulator>> = {
            let mut inner = self.inner.write();
            inner.drain().map(|(_, emulator)| emulator).collect()
        };
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "terminating all emulators");
        let results =
            futures::future::join_all(drained.iter().map(|emulator| emulator.terminate())).await;
        for (emulator, result) in drained.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(emulator = %emulator.id(), error = %e, "teardown during drain failed");
            }
        }
    }
}

/// Tears down a registered instance whose launch was abandoned before
/// provisioning finished.
struct LaunchGuard {
    registry: EmulatorRegistry,
    id: Uuid,
    armed: bool,
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.id;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(emulator = %id, "launch abandoned outside a runtime, instance left registered");
            return;
        };
        tracing::warn!(emulator = %id, "launch abandoned during boot, tearing down");
        let registry = self.registry.clone();
        handle.spawn(async move {
            if let Err(e) = registry.remove(id).await {
                tracing::error!(emulator = %id, error = %e, "cleanup after abandoned launch failed");
            }
        });
    }
}
