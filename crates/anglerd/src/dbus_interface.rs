use crate::engine::{EngineError, EngineHandle};
use angler_core::{IdentityId, IdentityStore, StoreError};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "io.angler.Enroll1";
pub const OBJECT_PATH: &str = "/io/angler/Enroll1";

/// D-Bus interface for the Angler enrollment daemon.
///
/// Bus name: io.angler.Enroll1
/// Object path: /io/angler/Enroll1
///
/// Session methods return the session status as JSON so a client can render
/// the next instruction without a second round trip.
pub struct AnglerService {
    engine: EngineHandle,
    store: Arc<dyn IdentityStore>,
}

impl AnglerService {
    pub fn new(engine: EngineHandle, store: Arc<dyn IdentityStore>) -> Self {
        Self { engine, store }
    }

    async fn status_json(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(failed)?;
        serde_json::to_string(&status).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

/// Run a store call on the blocking pool. SQLite work must not stall the
/// D-Bus executor, and the finalizer thread may hold the connection.
async fn store_call<T, F>(store: &Arc<dyn IdentityStore>, f: F) -> zbus::fdo::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn IdentityStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(failed)?
        .map_err(failed)
}

#[interface(name = "io.angler.Enroll1")]
impl AnglerService {
    /// Begin a guided enrollment for `name`.
    async fn start_enrollment(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "start_enrollment requested");
        match self.engine.start(name).await {
            Ok(_) => self.status_json().await,
            Err(EngineError::Session(e)) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
            Err(e) => Err(failed(e)),
        }
    }

    /// Accept the still awaiting confirmation.
    async fn approve(&self) -> zbus::fdo::Result<String> {
        let result = self.engine.approve().await.map_err(failed)?;
        tracing::info!(?result, "capture approved");
        self.status_json().await
    }

    /// Reject the still awaiting confirmation and capture the same pose again.
    async fn retake(&self) -> zbus::fdo::Result<String> {
        let target = self.engine.retake().await.map_err(failed)?;
        tracing::info!(target = %target, "retake requested");
        self.status_json().await
    }

    /// Give up on the running session. Returns false if none was running.
    async fn abandon(&self) -> zbus::fdo::Result<bool> {
        let abandoned = self.engine.abandon().await.map_err(failed)?;
        tracing::info!(?abandoned, "abandon requested");
        Ok(abandoned.is_some())
    }

    /// Return the session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        self.status_json().await
    }

    /// List enrolled identities as JSON, oldest first.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.store.stream_identities().borrow().clone();
        serde_json::to_string(&identities).map_err(failed)
    }

    async fn count_identities(&self) -> zbus::fdo::Result<u32> {
        let count = store_call(&self.store, |store| store.count_identities()).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Remove an identity and all its embeddings. Returns the number of
    /// embeddings removed.
    async fn remove_identity(&self, id: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(id, "remove_identity requested");
        let id = IdentityId::from(id);
        let removed = store_call(&self.store, move |store| angler_core::remove_identity(store, &id)).await?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }
}
