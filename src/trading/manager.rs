//! Registry of running signal engines, one per follower account.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{EngineError, SignalEngine};

/// Owns the engines of every follower and their shared shutdown signal.
pub struct EngineManager {
    engines: RwLock<HashMap<String, Arc<SignalEngine>>>,
    shutdown: CancellationToken,
}

impl Default for EngineManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineManager {
    pub fn new() -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token cancelled by [`EngineManager::shutdown`].
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register an engine and start it.
    ///
    /// Fails if an engine for the same follower is already running. A
    /// stopped engine for that follower is replaced.
    pub async fn start_engine(&self, engine: Arc<SignalEngine>) -> Result<(), EngineError> {
        let follower = engine.follower_id().to_string();
        {
            let mut engines = self.engines.write().await;
            if engines.get(&follower).is_some_and(|e| e.is_running()) {
                return Err(EngineError::AlreadyRunning(follower));
            }
            engines.insert(follower.clone(), engine.clone());
        }

        if let Err(e) = engine.start(&self.shutdown).await {
            let mut engines = self.engines.write().await;
            if engines.get(&follower).is_some_and(|current| Arc::ptr_eq(current, &engine)) {
                engines.remove(&follower);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop a follower's engine. Unknown or stopped engines are a no-op.
    pub async fn stop_engine(&self, follower_id: &str) {
        let engine = self.engines.read().await.get(follower_id).cloned();
        if let Some(engine) = engine {
            engine.stop().await;
        }
    }

    /// Stop and start a registered engine again.
    pub async fn restart_engine(&self, follower_id: &str) -> Result<(), EngineError> {
        let engine = self
            .get(follower_id)
            .await
            .ok_or_else(|| EngineError::NotFound(follower_id.to_string()))?;

        self.stop_engine(follower_id).await;
        match engine.start(&self.shutdown).await {
            Ok(()) | Err(EngineError::AlreadyRunning(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, follower_id: &str) -> Option<Arc<SignalEngine>> {
        self.engines.read().await.get(follower_id).cloned()
    }

    /// Registered follower ids, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.engines.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn running_count(&self) -> usize {
        self.engines
            .read()
            .await
            .values()
            .filter(|e| e.is_running())
            .count()
    }

    /// Cancel the shared signal, stop every engine and clear the registry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let engines: Vec<Arc<SignalEngine>> = self.engines.write().await.drain().map(|(_, e)| e).collect();
        for engine in &engines {
            engine.stop().await;
        }

        info!(count = engines.len(), "All engines stopped");
    }
}
