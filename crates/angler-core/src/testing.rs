//! In-memory doubles for every capability trait.
//!
//! Compiled for this crate's tests and, behind the `testing` feature, for the
//! tests of downstream crates.

use crate::capability::{
    CaptureError, EmbeddingExtractor, FaceLocator, IdentityStore, InferenceError, PoseEstimator, StillCamera,
    StoreError,
};
use crate::frame::RawFrame;
use crate::types::{BoundingBox, Embedding, EmbeddingRecord, IdentityId, IdentityRecord, Pose};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Returns scripted poses in order, then `fallback` forever.
pub struct ScriptedPoseEstimator {
    script: VecDeque<Option<Pose>>,
    fallback: Option<Pose>,
}

impl ScriptedPoseEstimator {
    pub fn new(script: impl IntoIterator<Item = Option<Pose>>) -> Self {
        Self {
            script: script.into_iter().collect(),
            fallback: None,
        }
    }

    /// Always report `pose`.
    pub fn constant(pose: Option<Pose>) -> Self {
        Self {
            script: VecDeque::new(),
            fallback: pose,
        }
    }

    pub fn then(mut self, fallback: Option<Pose>) -> Self {
        self.fallback = fallback;
        self
    }
}

impl PoseEstimator for ScriptedPoseEstimator {
    fn detect_pose(&mut self, _frame: &RawFrame) -> Result<Option<Pose>, InferenceError> {
        Ok(self.script.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// A pose with a comfortably sized, level face at the given raw angles.
pub fn raw_pose(yaw: f32, pitch: f32) -> Pose {
    Pose {
        yaw,
        pitch,
        roll: 0.0,
        bounds: BoundingBox {
            x: 10.0,
            y: 10.0,
            width: 40.0,
            height: 40.0,
            confidence: 0.9,
            landmarks: None,
        },
        face_fraction: 0.2,
    }
}

/// Camera returning a flat grey still, or scripted failures first.
pub struct FakeCamera {
    width: u32,
    height: u32,
    failures: VecDeque<CaptureError>,
    captures: Arc<AtomicUsize>,
}

impl FakeCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            failures: VecDeque::new(),
            captures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_first(mut self, errors: impl IntoIterator<Item = CaptureError>) -> Self {
        self.failures = errors.into_iter().collect();
        self
    }

    /// Counter of capture attempts, shared with the camera.
    pub fn captures(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.captures)
    }
}

impl StillCamera for FakeCamera {
    fn capture_still(&mut self) -> Result<RawFrame, CaptureError> {
        let n = self.captures.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.pop_front() {
            return Err(error);
        }
        Ok(RawFrame::filled(self.width, self.height, 120).with_sequence(n as u32))
    }
}

/// Face locator with a fixed answer per call.
pub struct FakeLocator {
    face: Option<BoundingBox>,
    missing: HashSet<usize>,
    blind: bool,
    calls: usize,
}

impl FakeLocator {
    /// A face covering the middle of every frame.
    pub fn always() -> Self {
        Self {
            face: None,
            missing: HashSet::new(),
            blind: false,
            calls: 0,
        }
    }

    pub fn never() -> Self {
        Self {
            blind: true,
            ..Self::always()
        }
    }

    /// No face on the listed calls (0-based).
    pub fn missing_on(indices: &[usize]) -> Self {
        Self {
            missing: indices.iter().copied().collect(),
            ..Self::always()
        }
    }

    pub fn with_box(face: BoundingBox) -> Self {
        Self {
            face: Some(face),
            ..Self::always()
        }
    }
}

impl FaceLocator for FakeLocator {
    fn detect_largest_face(&mut self, frame: &RawFrame) -> Result<Option<BoundingBox>, InferenceError> {
        let call = self.calls;
        self.calls += 1;
        if self.blind || self.missing.contains(&call) {
            return Ok(None);
        }
        Ok(Some(self.face.clone().unwrap_or(BoundingBox {
            x: frame.width as f32 / 4.0,
            y: frame.height as f32 / 4.0,
            width: frame.width as f32 / 2.0,
            height: frame.height as f32 / 2.0,
            confidence: 0.95,
            landmarks: None,
        })))
    }
}

/// Extractor producing a deterministic vector from the crop's brightness.
///
/// Tracks how many extractions overlap so tests can check serialization.
pub struct FakeExtractor {
    dim: usize,
    delay: Duration,
    fail_on: HashSet<usize>,
    calls: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(u32, u32)>>>,
}

impl FakeExtractor {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            delay: Duration::ZERO,
            fail_on: HashSet::new(),
            calls: 0,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    /// Fail the listed calls (0-based).
    pub fn failing_on(mut self, indices: &[usize]) -> Self {
        self.fail_on = indices.iter().copied().collect();
        self
    }

    /// Highest number of extractions ever running at once.
    pub fn peak_concurrency(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.peak)
    }

    /// Crop sizes in call order.
    pub fn seen_sizes(&self) -> Arc<Mutex<Vec<(u32, u32)>>> {
        Arc::clone(&self.seen)
    }
}

impl EmbeddingExtractor for FakeExtractor {
    fn extract_embedding(&mut self, crop: &RawFrame) -> Result<Embedding, InferenceError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        lock(&self.seen).push((crop.width, crop.height));

        let call = self.calls;
        self.calls += 1;
        let result = if self.fail_on.contains(&call) {
            Err(InferenceError::Other(format!("scripted failure on call {call}")))
        } else {
            let seed = crop.avg_brightness() / 255.0;
            Ok(Embedding {
                values: (0..self.dim).map(|i| seed + i as f32 * 0.01).collect(),
                model_version: Some("fake".into()),
            })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
struct MemoryInner {
    identities: Vec<IdentityRecord>,
    embeddings: Vec<EmbeddingRecord>,
    next_id: u64,
    appends_before_failure: Option<usize>,
    fail_creates: bool,
}

/// Identity store kept in memory, with write-failure injection.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    identities_tx: watch::Sender<Vec<IdentityRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (identities_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Mutex::new(MemoryInner::default()),
            identities_tx,
        }
    }

    /// Let `n` more embedding writes succeed, then fail every one after.
    pub fn fail_appends_after(&self, n: usize) {
        lock(&self.inner).appends_before_failure = Some(n);
    }

    pub fn fail_creates(&self) {
        lock(&self.inner).fail_creates = true;
    }

    pub fn embeddings(&self) -> Vec<EmbeddingRecord> {
        lock(&self.inner).embeddings.clone()
    }

    pub fn identities(&self) -> Vec<IdentityRecord> {
        lock(&self.inner).identities.clone()
    }

    fn publish(&self, inner: &MemoryInner) {
        self.identities_tx.send_replace(inner.identities.clone());
    }
}

impl IdentityStore for MemoryStore {
    fn create_identity(&self, name: &str, declared_count: usize) -> Result<IdentityRecord, StoreError> {
        let mut inner = lock(&self.inner);
        if inner.fail_creates {
            return Err(StoreError::Backend("scripted create failure".into()));
        }
        inner.next_id += 1;
        let record = IdentityRecord {
            id: IdentityId(format!("mem-{}", inner.next_id)),
            name: name.to_string(),
            declared_image_count: declared_count,
            created_at: format!("1970-01-01T00:00:{:02}Z", inner.next_id % 60),
        };
        inner.identities.push(record.clone());
        self.publish(&inner);
        Ok(record)
    }

    fn delete_identity(&self, id: &IdentityId) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        let before = inner.identities.len();
        inner.identities.retain(|r| &r.id != id);
        if inner.identities.len() == before {
            return Err(StoreError::NotFound(id.clone()));
        }
        self.publish(&inner);
        Ok(())
    }

    fn append_embedding(&self, id: &IdentityId, name: &str, embedding: &Embedding) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        if let Some(left) = inner.appends_before_failure.as_mut() {
            if *left == 0 {
                return Err(StoreError::Backend("scripted append failure".into()));
            }
            *left -= 1;
        }
        inner.embeddings.push(EmbeddingRecord {
            identity_id: id.clone(),
            identity_name: name.to_string(),
            embedding: embedding.clone(),
        });
        Ok(())
    }

    fn remove_embeddings(&self, id: &IdentityId) -> Result<usize, StoreError> {
        let mut inner = lock(&self.inner);
        let before = inner.embeddings.len();
        inner.embeddings.retain(|r| &r.identity_id != id);
        Ok(before - inner.embeddings.len())
    }

    fn count_identities(&self) -> Result<usize, StoreError> {
        Ok(lock(&self.inner).identities.len())
    }

    fn stream_identities(&self) -> watch::Receiver<Vec<IdentityRecord>> {
        self.identities_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::remove_identity;

    #[test]
    fn test_memory_store_stream_follows_writes() {
        let store = MemoryStore::new();
        let mut rx = store.stream_identities();
        assert!(rx.borrow_and_update().is_empty());

        let alice = store.create_identity("Alice", 4).unwrap();
        store.create_identity("Bob", 4).unwrap();
        assert!(rx.has_changed().unwrap());
        let names: Vec<String> = rx.borrow_and_update().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);

        store.append_embedding(&alice.id, "Alice", &Embedding { values: vec![1.0], model_version: None }).unwrap();
        assert_eq!(remove_identity(&store, &alice.id), Ok(1));
        assert_eq!(rx.borrow().len(), 1);
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_delete_unknown_identity() {
        let store = MemoryStore::new();
        let id = IdentityId::from("nope");
        assert_eq!(store.delete_identity(&id), Err(StoreError::NotFound(id)));
    }

    #[test]
    fn test_locator_never_finds_a_face() {
        let mut locator = FakeLocator::never();
        let frame = RawFrame::filled(8, 8, 0);
        for _ in 0..3 {
            assert!(locator.detect_largest_face(&frame).unwrap().is_none());
        }
    }

    #[test]
    fn test_camera_fails_first() {
        let mut camera = FakeCamera::new(4, 4).failing_first([CaptureError::DarkFrame]);
        assert_eq!(camera.capture_still(), Err(CaptureError::DarkFrame));
        assert!(camera.capture_still().is_ok());
        assert_eq!(camera.captures().load(Ordering::SeqCst), 2);
    }
}
