//! Enrollment finalizer: approved stills → face crops → embeddings → identity.
//!
//! All embeddings are computed before the identity is created. If any write
//! fails after that, the identity and its embeddings are deleted again so the
//! store never holds a half-enrolled person.

use crate::capability::{EmbeddingExtractor, FaceLocator, IdentityStore, SharedExtractor, StoreError};
use crate::frame::RawFrame;
use crate::sequencer::EnrollmentBatch;
use crate::types::{Embedding, IdentityRecord};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FinalizeError {
    #[error("store write failed: {0}")]
    Store(#[from] StoreError),
    #[error("store write failed ({source}) and cleanup failed ({cleanup})")]
    Compensation { source: StoreError, cleanup: StoreError },
}

/// Which count goes into [`IdentityRecord::declared_image_count`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclaredCount {
    /// Number of approved stills, even if some yielded no face.
    #[default]
    Approved,
    /// Number of embeddings actually persisted.
    Persisted,
}

impl FromStr for DeclaredCount {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approved" => Ok(DeclaredCount::Approved),
            "persisted" => Ok(DeclaredCount::Persisted),
            other => Err(format!("unknown declared-count policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrollmentReport {
    pub identity: IdentityRecord,
    pub embeddings: usize,
    /// Approved stills that produced no embedding.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    Enrolled(EnrollmentReport),
    /// No approved still yielded a usable face; nothing was written.
    NoFaces,
    /// Cancelled before anything was written.
    Cancelled,
}

pub struct Finalizer<L, E, S> {
    locator: L,
    extractor: SharedExtractor<E>,
    store: S,
    policy: DeclaredCount,
}

impl<L, E, S> Finalizer<L, E, S>
where
    L: FaceLocator,
    E: EmbeddingExtractor,
    S: IdentityStore,
{
    pub fn new(locator: L, extractor: SharedExtractor<E>, store: S, policy: DeclaredCount) -> Self {
        Self {
            locator,
            extractor,
            store,
            policy,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enroll `batch`. `cancel` is checked before the first store write.
    pub fn finalize(&mut self, batch: &EnrollmentBatch, cancel: &AtomicBool) -> Result<FinalizeOutcome, FinalizeError> {
        let approved = batch.frames.len();

        let crops: Vec<RawFrame> = batch
            .frames
            .iter()
            .enumerate()
            .filter_map(|(i, frame)| self.crop_largest_face(i, frame))
            .collect();

        // One crop at a time through the process-wide extractor lock.
        let mut embeddings: Vec<Embedding> = Vec::with_capacity(crops.len());
        for (i, crop) in crops.iter().enumerate() {
            match self.extractor.extract(crop) {
                Ok(embedding) => embeddings.push(embedding),
                Err(error) => tracing::warn!(crop = i, %error, "embedding extraction failed, dropping crop"),
            }
        }

        if embeddings.is_empty() {
            tracing::warn!(name = %batch.name, approved, "no usable face in any approved frame, nothing enrolled");
            return Ok(FinalizeOutcome::NoFaces);
        }
        if cancel.load(Ordering::SeqCst) {
            tracing::info!(name = %batch.name, "enrollment cancelled before persisting");
            return Ok(FinalizeOutcome::Cancelled);
        }

        let declared = match self.policy {
            DeclaredCount::Approved => approved,
            DeclaredCount::Persisted => embeddings.len(),
        };

        let identity = self.store.create_identity(&batch.name, declared)?;

        for embedding in &embeddings {
            if let Err(source) = self.store.append_embedding(&identity.id, &identity.name, embedding) {
                tracing::warn!(identity = %identity.id, error = %source, "embedding write failed, rolling back identity");
                return Err(match crate::capability::remove_identity(&self.store, &identity.id) {
                    Ok(_) => FinalizeError::Store(source),
                    Err(cleanup) => FinalizeError::Compensation { source, cleanup },
                });
            }
        }

        let report = EnrollmentReport {
            embeddings: embeddings.len(),
            dropped: approved - embeddings.len(),
            identity,
        };
        tracing::info!(
            identity = %report.identity.id,
            name = %report.identity.name,
            declared,
            embeddings = report.embeddings,
            dropped = report.dropped,
            "identity enrolled"
        );
        Ok(FinalizeOutcome::Enrolled(report))
    }

    fn crop_largest_face(&mut self, index: usize, frame: &RawFrame) -> Option<RawFrame> {
        let face = match self.locator.detect_largest_face(frame) {
            Ok(Some(face)) => face,
            Ok(None) => {
                tracing::debug!(frame = index, "no face in approved frame, dropping");
                return None;
            }
            Err(error) => {
                tracing::warn!(frame = index, %error, "face detection failed, dropping frame");
                return None;
            }
        };
        let rect = face.clamp_to(frame.width, frame.height)?;
        frame.crop(&rect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExtractor, FakeLocator, MemoryStore};
    use std::sync::Arc;

    fn batch(n: usize) -> EnrollmentBatch {
        EnrollmentBatch {
            name: "Alice".into(),
            frames: (0..n)
                .map(|i| RawFrame::filled(64, 48, 100).with_sequence(i as u32))
                .collect(),
        }
    }

    fn finalizer(
        locator: FakeLocator,
        store: Arc<MemoryStore>,
        policy: DeclaredCount,
    ) -> Finalizer<FakeLocator, FakeExtractor, Arc<MemoryStore>> {
        Finalizer::new(locator, SharedExtractor::new(FakeExtractor::new(8)), store, policy)
    }

    #[test]
    fn test_all_frames_enrolled() {
        let store = Arc::new(MemoryStore::new());
        let mut f = finalizer(FakeLocator::always(), store.clone(), DeclaredCount::Approved);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap();
        let FinalizeOutcome::Enrolled(report) = outcome else {
            panic!("expected enrollment, got {outcome:?}");
        };
        assert_eq!(report.identity.declared_image_count, 4);
        assert_eq!(report.embeddings, 4);
        assert_eq!(store.count_identities().unwrap(), 1);
        let records = store.embeddings();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.identity_id == report.identity.id && r.identity_name == "Alice"));
    }

    #[test]
    fn test_partial_crop_failure_keeps_identity() {
        let store = Arc::new(MemoryStore::new());
        let mut f = finalizer(FakeLocator::missing_on(&[2]), store.clone(), DeclaredCount::Approved);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap();
        let FinalizeOutcome::Enrolled(report) = outcome else {
            panic!("expected enrollment, got {outcome:?}");
        };
        assert_eq!(report.embeddings, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.identity.declared_image_count, 4);
        assert_eq!(store.count_identities().unwrap(), 1);
        assert_eq!(store.embeddings().len(), 3);
    }

    #[test]
    fn test_persisted_policy_recounts() {
        let store = Arc::new(MemoryStore::new());
        let mut f = finalizer(FakeLocator::missing_on(&[0, 3]), store.clone(), DeclaredCount::Persisted);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap();
        let FinalizeOutcome::Enrolled(report) = outcome else {
            panic!("expected enrollment, got {outcome:?}");
        };
        assert_eq!(report.identity.declared_image_count, 2);
        assert_eq!(store.embeddings().len(), 2);
    }

    #[test]
    fn test_no_faces_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let mut f = finalizer(FakeLocator::never(), store.clone(), DeclaredCount::Approved);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap();
        assert!(matches!(outcome, FinalizeOutcome::NoFaces));
        assert_eq!(store.count_identities().unwrap(), 0);
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_store_failure_rolls_back_identity() {
        let store = Arc::new(MemoryStore::new());
        store.fail_appends_after(2);
        let mut f = finalizer(FakeLocator::always(), store.clone(), DeclaredCount::Approved);

        let err = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FinalizeError::Store(StoreError::Backend(_))));
        assert_eq!(store.count_identities().unwrap(), 0);
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_create_failure_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        store.fail_creates();
        let mut f = finalizer(FakeLocator::always(), store.clone(), DeclaredCount::Approved);

        let err = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, FinalizeError::Store(StoreError::Backend(_))));
        assert!(store.identities().is_empty());
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_extraction_failure_drops_crop() {
        let store = Arc::new(MemoryStore::new());
        let extractor = SharedExtractor::new(FakeExtractor::new(8).failing_on(&[1]));
        let mut f = Finalizer::new(FakeLocator::always(), extractor, store.clone(), DeclaredCount::Approved);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(false)).unwrap();
        let FinalizeOutcome::Enrolled(report) = outcome else {
            panic!("expected enrollment, got {outcome:?}");
        };
        assert_eq!(report.embeddings, 3);
        assert_eq!(report.dropped, 1);
        assert_eq!(store.embeddings().len(), 3);
    }

    #[test]
    fn test_cancel_before_write() {
        let store = Arc::new(MemoryStore::new());
        let mut f = finalizer(FakeLocator::always(), store.clone(), DeclaredCount::Approved);

        let outcome = f.finalize(&batch(4), &AtomicBool::new(true)).unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Cancelled));
        assert_eq!(store.count_identities().unwrap(), 0);
    }

    #[test]
    fn test_crop_is_clamped_to_frame() {
        let store = Arc::new(MemoryStore::new());
        let locator = FakeLocator::with_box(crate::types::BoundingBox {
            x: 40.0, y: -10.0, width: 100.0, height: 30.0,
            confidence: 0.9, landmarks: None,
        });
        let extractor = FakeExtractor::new(4);
        let seen = extractor.seen_sizes();
        let mut f = Finalizer::new(locator, SharedExtractor::new(extractor), store, DeclaredCount::Approved);

        f.finalize(&batch(1), &AtomicBool::new(false)).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[(24, 20)]);
    }

    #[test]
    fn test_extraction_never_overlaps_across_threads() {
        let extractor = FakeExtractor::new(4).with_delay_ms(2);
        let peak = extractor.peak_concurrency();
        let shared = SharedExtractor::new(extractor);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let store = Arc::new(MemoryStore::new());
                let shared = shared.clone();
                scope.spawn(move || {
                    let mut f = Finalizer::new(FakeLocator::always(), shared, store, DeclaredCount::Approved);
                    f.finalize(&batch(3), &AtomicBool::new(false)).unwrap();
                });
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_declared_count_parse() {
        assert_eq!("Persisted".parse::<DeclaredCount>(), Ok(DeclaredCount::Persisted));
        assert!("all".parse::<DeclaredCount>().is_err());
    }
}
