//! Seams to the outside world: pose detection, still capture, face location,
//! embedding extraction and identity persistence.
//!
//! Each trait has one production implementation (SCRFD/ArcFace models in this
//! crate, the V4L2 camera in `angler-hw`, SQLite in `angler-store`) and one test
//! double in [`crate::testing`].

use crate::frame::RawFrame;
use crate::types::{BoundingBox, Embedding, IdentityId, IdentityRecord, Pose};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;

/// Failure of a model-backed capability.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector: {0}")]
    Detector(#[from] crate::detector::DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] crate::recognizer::RecognizerError),
    #[error("inference lock poisoned")]
    Poisoned,
    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("still capture failed: {0}")]
    Failed(String),
    #[error("captured frame is too dark")]
    DarkFrame,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Estimates head pose on live preview frames.
pub trait PoseEstimator: Send {
    /// `Ok(None)` when no face is visible.
    fn detect_pose(&mut self, frame: &RawFrame) -> Result<Option<Pose>, InferenceError>;
}

/// Produces one high-quality still, unmirrored and rotation-corrected.
pub trait StillCamera: Send {
    fn capture_still(&mut self) -> Result<RawFrame, CaptureError>;
}

/// Finds the largest face in an approved still.
pub trait FaceLocator: Send {
    fn detect_largest_face(&mut self, frame: &RawFrame) -> Result<Option<BoundingBox>, InferenceError>;
}

/// Turns a face crop into an embedding. Implementations are not reentrant;
/// share them through [`SharedExtractor`].
pub trait EmbeddingExtractor: Send {
    fn extract_embedding(&mut self, crop: &RawFrame) -> Result<Embedding, InferenceError>;
}

/// Identity and embedding persistence.
///
/// The store gives no multi-record atomicity; callers that need it compensate
/// on failure.
pub trait IdentityStore: Send + Sync {
    fn create_identity(&self, name: &str, declared_count: usize) -> Result<IdentityRecord, StoreError>;
    fn delete_identity(&self, id: &IdentityId) -> Result<(), StoreError>;
    fn append_embedding(&self, id: &IdentityId, name: &str, embedding: &Embedding) -> Result<(), StoreError>;
    /// Returns the number of embeddings removed.
    fn remove_embeddings(&self, id: &IdentityId) -> Result<usize, StoreError>;
    fn count_identities(&self) -> Result<usize, StoreError>;
    /// Live, creation-ordered view of every identity.
    fn stream_identities(&self) -> watch::Receiver<Vec<IdentityRecord>>;
}

impl<S: IdentityStore + ?Sized> IdentityStore for Arc<S> {
    fn create_identity(&self, name: &str, declared_count: usize) -> Result<IdentityRecord, StoreError> {
        (**self).create_identity(name, declared_count)
    }

    fn delete_identity(&self, id: &IdentityId) -> Result<(), StoreError> {
        (**self).delete_identity(id)
    }

    fn append_embedding(&self, id: &IdentityId, name: &str, embedding: &Embedding) -> Result<(), StoreError> {
        (**self).append_embedding(id, name, embedding)
    }

    fn remove_embeddings(&self, id: &IdentityId) -> Result<usize, StoreError> {
        (**self).remove_embeddings(id)
    }

    fn count_identities(&self) -> Result<usize, StoreError> {
        (**self).count_identities()
    }

    fn stream_identities(&self) -> watch::Receiver<Vec<IdentityRecord>> {
        (**self).stream_identities()
    }
}

/// Remove an identity and every embedding that references it.
///
/// Embeddings go first so a failure never leaves orphaned vectors behind a
/// deleted identity.
pub fn remove_identity<S: IdentityStore + ?Sized>(store: &S, id: &IdentityId) -> Result<usize, StoreError> {
    let removed = store.remove_embeddings(id)?;
    store.delete_identity(id)?;
    tracing::info!(identity = %id, embeddings = removed, "identity removed");
    Ok(removed)
}

/// Process-wide handle to a single embedding extractor.
///
/// Every clone shares one mutex, so at most one extraction runs at a time
/// regardless of how many sessions or threads hold a handle.
pub struct SharedExtractor<E> {
    inner: Arc<Mutex<E>>,
}

impl<E> Clone for SharedExtractor<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EmbeddingExtractor> SharedExtractor<E> {
    pub fn new(extractor: E) -> Self {
        Self {
            inner: Arc::new(Mutex::new(extractor)),
        }
    }

    /// Run one extraction while holding the process-wide lock.
    pub fn extract(&self, crop: &RawFrame) -> Result<Embedding, InferenceError> {
        let mut guard = self.inner.lock().map_err(|_| InferenceError::Poisoned)?;
        guard.extract_embedding(crop)
    }
}
