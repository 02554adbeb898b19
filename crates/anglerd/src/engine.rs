//! Capture engine: four OS threads around one [`CaptureSession`].
//!
//! - camera: produces live frames into a single-slot mailbox and serves still
//!   requests,
//! - pose worker: runs the pose estimator on the newest live frame,
//! - session actor: owns the session and applies every event in order,
//! - finalizer: turns approved stills into an identity.
//!
//! D-Bus handlers talk to the session actor through [`EngineHandle`].

use angler_core::sequencer::{Approval, CaptureOutcome, EnrollmentBatch, FrameOutcome};
use angler_core::{
    CaptureError, CaptureSession, EmbeddingExtractor, EnrollmentReport, FaceLocator, FinalizeError, FinalizeOutcome,
    Finalizer, IdentityId, IdentityStore, Phase, Pose, PoseEstimator, PoseTarget, RawFrame, SessionConfig,
    SessionError, SessionStatus, StillCamera,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// How long idle threads sleep or wait before re-checking for shutdown.
const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("engine thread exited")]
    ChannelClosed,
}

/// A camera that can also stream live preview frames.
pub trait FrameSource: StillCamera + 'static {
    fn live_frame(&mut self) -> Result<RawFrame, CaptureError>;
}

impl FrameSource for angler_hw::Camera {
    fn live_frame(&mut self) -> Result<RawFrame, CaptureError> {
        Ok(self.capture_frame()?)
    }
}

/// Everything the engine owns once spawned.
pub struct EngineParts<C, P, L, E, S> {
    pub camera: C,
    pub estimator: P,
    pub finalizer: Finalizer<L, E, S>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub session: SessionConfig,
    /// Directory for the mirrored confirmation preview; `None` disables it.
    pub preview_dir: Option<PathBuf>,
    /// Pause between live frames. Zero when the camera blocks on its own.
    pub frame_interval: Duration,
}

/// Reply to [`EngineHandle::approve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApproveResult {
    Advanced { step: usize, target: PoseTarget },
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentSummary {
    pub identity: IdentityId,
    pub name: String,
    pub declared_image_count: usize,
    pub embeddings: usize,
    pub dropped: usize,
}

impl From<EnrollmentReport> for EnrollmentSummary {
    fn from(report: EnrollmentReport) -> Self {
        Self {
            identity: report.identity.id,
            name: report.identity.name,
            declared_image_count: report.identity.declared_image_count,
            embeddings: report.embeddings,
            dropped: report.dropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStatus {
    #[serde(flatten)]
    pub session: SessionStatus,
    /// Mirrored preview of the still awaiting confirmation.
    pub preview: Option<PathBuf>,
    /// Result of the most recent successful enrollment.
    pub last_enrollment: Option<EnrollmentSummary>,
}

enum Command {
    Start {
        name: String,
        reply: oneshot::Sender<Result<PoseTarget, SessionError>>,
    },
    Approve {
        reply: oneshot::Sender<Result<ApproveResult, SessionError>>,
    },
    Retake {
        reply: oneshot::Sender<Result<PoseTarget, SessionError>>,
    },
    Abandon {
        reply: oneshot::Sender<Option<Phase>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

enum Event {
    Command(Command),
    Pose(Option<Pose>),
    Capture(Result<RawFrame, CaptureError>),
    Finalized {
        job: u64,
        result: Result<FinalizeOutcome, FinalizeError>,
    },
    Shutdown,
}

struct FinalizeJob {
    id: u64,
    batch: EnrollmentBatch,
    cancel: Arc<AtomicBool>,
}

/// Clone-safe handle to the session actor.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Event>,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Command(make(reply_tx)))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Begin a guided enrollment for `name`; returns the first pose to hold.
    pub async fn start(&self, name: &str) -> Result<PoseTarget, EngineError> {
        let name = name.to_string();
        Ok(self.request(|reply| Command::Start { name, reply }).await??)
    }

    pub async fn approve(&self) -> Result<ApproveResult, EngineError> {
        Ok(self.request(|reply| Command::Approve { reply }).await??)
    }

    pub async fn retake(&self) -> Result<PoseTarget, EngineError> {
        Ok(self.request(|reply| Command::Retake { reply }).await??)
    }

    /// Returns the phase that was abandoned, `None` if nothing was running.
    pub async fn abandon(&self) -> Result<Option<Phase>, EngineError> {
        self.request(|reply| Command::Abandon { reply }).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

/// Single-slot mailbox between the camera and the pose worker. A new frame
/// replaces one that has not been picked up yet.
#[derive(Default)]
struct LatestFrame {
    slot: Mutex<Option<RawFrame>>,
    ready: Condvar,
}

impl LatestFrame {
    /// Returns true if an unread frame was overwritten.
    fn put(&self, frame: RawFrame) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let replaced = slot.replace(frame).is_some();
        self.ready.notify_one();
        replaced
    }

    fn take(&self, timeout: Duration) -> Option<RawFrame> {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |s| s.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }
}

/// Running engine. Call [`Engine::shutdown`] to stop every thread.
pub struct Engine {
    handle: EngineHandle,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn spawn<C, P, L, E, S>(parts: EngineParts<C, P, L, E, S>, settings: EngineSettings) -> Result<Self, EngineError>
    where
        C: FrameSource,
        P: PoseEstimator + 'static,
        L: FaceLocator + 'static,
        E: EmbeddingExtractor + 'static,
        S: IdentityStore + 'static,
    {
        let EngineParts {
            mut camera,
            mut estimator,
            mut finalizer,
        } = parts;

        let (tx, mut rx) = mpsc::channel::<Event>(16);
        let (still_tx, still_rx) = std_mpsc::channel::<()>();
        let (jobs_tx, jobs_rx) = std_mpsc::channel::<FinalizeJob>();
        let latest = Arc::new(LatestFrame::default());
        let paused = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(4);

        {
            let events = tx.clone();
            let latest = Arc::clone(&latest);
            let paused = Arc::clone(&paused);
            let shutdown = Arc::clone(&shutdown);
            let interval = settings.frame_interval;
            threads.push(spawn_named("angler-camera", move || {
                tracing::info!("camera thread started");
                run_camera(&mut camera, &latest, &still_rx, &events, &paused, &shutdown, interval);
                tracing::info!("camera thread exiting");
            })?);
        }

        {
            let events = tx.clone();
            let latest = Arc::clone(&latest);
            let paused = Arc::clone(&paused);
            let shutdown = Arc::clone(&shutdown);
            threads.push(spawn_named("angler-pose", move || {
                tracing::info!("pose worker started");
                run_pose_worker(&mut estimator, &latest, &events, &paused, &shutdown);
                tracing::info!("pose worker exiting");
            })?);
        }

        {
            let events = tx.clone();
            threads.push(spawn_named("angler-finalizer", move || {
                tracing::info!("finalizer thread started");
                while let Ok(job) = jobs_rx.recv() {
                    let result = finalizer.finalize(&job.batch, &job.cancel);
                    let result = discard_if_cancelled(finalizer.store(), result, &job.cancel);
                    if events.blocking_send(Event::Finalized { job: job.id, result }).is_err() {
                        break;
                    }
                }
                tracing::info!("finalizer thread exiting");
            })?);
        }

        let mut actor = SessionActor {
            session: CaptureSession::new(settings.session),
            paused: Arc::clone(&paused),
            still_tx,
            jobs_tx,
            next_job: 0,
            finalizing: None,
            preview_dir: settings.preview_dir,
            preview: None,
            last_enrollment: None,
        };
        threads.push(spawn_named("angler-session", move || {
            tracing::info!("session actor started");
            while let Some(event) = rx.blocking_recv() {
                if matches!(event, Event::Shutdown) {
                    break;
                }
                actor.handle(event);
            }
            tracing::info!("session actor exiting");
        })?);

        Ok(Self {
            handle: EngineHandle { tx },
            shutdown,
            threads,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop all threads and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.handle.tx.send(Event::Shutdown).await;
        let threads = self.threads;
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let _ = thread.join();
            }
        })
        .await;
        if let Err(e) = joined {
            tracing::warn!(error = %e, "engine threads did not join cleanly");
        }
    }
}

fn spawn_named<F>(name: &'static str, f: F) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .map_err(|source| EngineError::Spawn { name, source })
}

/// Undo an enrollment whose session was abandoned after the cancel check had
/// already passed, so abandoning never leaves a new identity behind.
fn discard_if_cancelled<S: IdentityStore>(
    store: &S,
    result: Result<FinalizeOutcome, FinalizeError>,
    cancel: &AtomicBool,
) -> Result<FinalizeOutcome, FinalizeError> {
    if !cancel.load(Ordering::SeqCst) {
        return result;
    }
    let Ok(FinalizeOutcome::Enrolled(report)) = &result else {
        return result;
    };
    match angler_core::remove_identity(store, &report.identity.id) {
        Ok(embeddings) => {
            tracing::info!(identity = %report.identity.id, embeddings, "session abandoned, enrollment rolled back");
            Ok(FinalizeOutcome::Cancelled)
        }
        Err(error) => {
            tracing::warn!(identity = %report.identity.id, %error, "session abandoned but enrollment could not be rolled back");
            result
        }
    }
}

fn run_camera<C: FrameSource>(
    camera: &mut C,
    latest: &LatestFrame,
    stills: &std_mpsc::Receiver<()>,
    events: &mpsc::Sender<Event>,
    paused: &AtomicBool,
    shutdown: &AtomicBool,
    interval: Duration,
) {
    let mut overwritten = 0u64;
    while !shutdown.load(Ordering::SeqCst) {
        match stills.try_recv() {
            Ok(()) => {
                let result = camera.capture_still();
                if events.blocking_send(Event::Capture(result)).is_err() {
                    break;
                }
                continue;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        if paused.load(Ordering::SeqCst) {
            std::thread::sleep(IDLE_POLL);
            continue;
        }

        match camera.live_frame() {
            Ok(frame) => {
                if latest.put(frame) {
                    overwritten += 1;
                    tracing::trace!(overwritten, "pose worker behind, replaced unread frame");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "live frame capture failed");
                std::thread::sleep(IDLE_POLL);
            }
        }
        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }
}

fn run_pose_worker<P: PoseEstimator>(
    estimator: &mut P,
    latest: &LatestFrame,
    events: &mpsc::Sender<Event>,
    paused: &AtomicBool,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::SeqCst) {
        let Some(frame) = latest.take(IDLE_POLL) else {
            continue;
        };
        if paused.load(Ordering::SeqCst) {
            continue;
        }
        let pose = match estimator.detect_pose(&frame) {
            Ok(pose) => pose,
            Err(error) => {
                tracing::debug!(%error, seq = frame.sequence, "pose estimation failed, treating as no face");
                None
            }
        };
        if events.blocking_send(Event::Pose(pose)).is_err() {
            break;
        }
    }
}

struct SessionActor {
    session: CaptureSession,
    paused: Arc<AtomicBool>,
    still_tx: std_mpsc::Sender<()>,
    jobs_tx: std_mpsc::Sender<FinalizeJob>,
    next_job: u64,
    /// Job id and cancel flag of the finalization in progress.
    finalizing: Option<(u64, Arc<AtomicBool>)>,
    preview_dir: Option<PathBuf>,
    preview: Option<PathBuf>,
    last_enrollment: Option<EnrollmentSummary>,
}

impl SessionActor {
    fn handle(&mut self, event: Event) {
        match event {
            Event::Command(command) => self.on_command(command),
            Event::Pose(pose) => self.on_pose(pose.as_ref()),
            Event::Capture(result) => self.on_capture(result),
            Event::Finalized { job, result } => self.on_finalized(job, result),
            Event::Shutdown => {}
        }
        self.paused.store(self.session.is_paused(), Ordering::SeqCst);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { name, reply } => {
                let result = self.session.start(&name);
                if result.is_ok() {
                    self.preview = None;
                }
                let _ = reply.send(result);
            }
            Command::Approve { reply } => {
                let _ = reply.send(self.approve());
            }
            Command::Retake { reply } => {
                let result = self.session.retake();
                if result.is_ok() {
                    self.preview = None;
                }
                let _ = reply.send(result);
            }
            Command::Abandon { reply } => {
                let abandoned = self.session.abandon();
                if abandoned == Some(Phase::Finalizing) {
                    if let Some((job, cancel)) = self.finalizing.take() {
                        tracing::info!(job, "cancelling finalization");
                        cancel.store(true, Ordering::SeqCst);
                    }
                }
                if abandoned.is_some() {
                    self.preview = None;
                }
                let _ = reply.send(abandoned);
            }
            Command::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    session: self.session.status(),
                    preview: self.preview.clone(),
                    last_enrollment: self.last_enrollment.clone(),
                });
            }
        }
    }

    fn approve(&mut self) -> Result<ApproveResult, SessionError> {
        let approval = self.session.approve()?;
        self.preview = None;
        match approval {
            Approval::Advanced { step, target } => Ok(ApproveResult::Advanced { step, target }),
            Approval::Finalize(batch) => {
                self.next_job += 1;
                let job = self.next_job;
                let cancel = Arc::new(AtomicBool::new(false));
                self.finalizing = Some((job, Arc::clone(&cancel)));
                let sent = self.jobs_tx.send(FinalizeJob {
                    id: job,
                    batch,
                    cancel,
                });
                if sent.is_err() {
                    tracing::warn!(job, "finalizer thread gone");
                    self.finalizing = None;
                    let _ = self.session.finish(Err("finalizer unavailable".into()));
                }
                Ok(ApproveResult::Finalizing)
            }
        }
    }

    fn on_pose(&mut self, pose: Option<&Pose>) {
        if let FrameOutcome::CaptureRequested { step, target } = self.session.on_pose(pose) {
            tracing::debug!(step, target = %target, "requesting still");
            if self.still_tx.send(()).is_err() {
                tracing::warn!("camera thread gone");
                let _ = self
                    .session
                    .on_capture(Err(CaptureError::Failed("camera unavailable".into())));
            }
        }
    }

    fn on_capture(&mut self, result: Result<RawFrame, CaptureError>) {
        match self.session.on_capture(result) {
            Ok(CaptureOutcome::AwaitingConfirmation { .. }) => self.write_preview(),
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "unexpected capture result"),
        }
    }

    fn on_finalized(&mut self, job: u64, result: Result<FinalizeOutcome, FinalizeError>) {
        match &self.finalizing {
            Some((current, _)) if *current == job => self.finalizing = None,
            _ => {
                if let Ok(FinalizeOutcome::Enrolled(report)) = result {
                    tracing::warn!(job, identity = %report.identity.id, "abandoned session was enrolled anyway");
                    self.last_enrollment = Some(EnrollmentSummary::from(report));
                } else {
                    tracing::debug!(job, "ignoring result of a superseded finalization");
                }
                return;
            }
        }

        let result = match result {
            Ok(FinalizeOutcome::Enrolled(report)) => {
                let id = report.identity.id.clone();
                self.last_enrollment = Some(EnrollmentSummary::from(report));
                Ok(Some(id))
            }
            Ok(FinalizeOutcome::NoFaces) | Ok(FinalizeOutcome::Cancelled) => Ok(None),
            Err(error) => Err(error.to_string()),
        };
        if let Err(error) = self.session.finish(result) {
            tracing::warn!(%error, "finalization result not applied");
        }
    }

    fn write_preview(&mut self) {
        self.preview = None;
        let (Some(dir), Some(frame)) = (&self.preview_dir, self.session.pending_frame()) else {
            return;
        };
        match write_png(dir, &frame.mirrored()) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "preview written");
                self.preview = Some(path);
            }
            Err(error) => tracing::warn!(%error, "failed to write preview"),
        }
    }
}

/// Save `frame` as `preview.png` in `dir`.
fn write_png(dir: &Path, frame: &RawFrame) -> Result<PathBuf, image::ImageError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("preview.png");
    image::save_buffer(&path, &frame.data, frame.width, frame.height, image::ExtendedColorType::L8)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use angler_core::testing::{raw_pose, FakeCamera, FakeExtractor, FakeLocator, MemoryStore};
    use angler_core::{DeclaredCount, InferenceError, SharedExtractor};
    use std::time::Instant;

    impl FrameSource for FakeCamera {
        fn live_frame(&mut self) -> Result<RawFrame, CaptureError> {
            Ok(RawFrame::filled(64, 48, 110))
        }
    }

    /// Pose estimator whose answer the test changes between steps.
    #[derive(Clone, Default)]
    struct SharedPose(Arc<Mutex<Option<Pose>>>);

    impl SharedPose {
        fn hold(&self, target: PoseTarget) {
            let (yaw, pitch) = match target {
                PoseTarget::LookRight => (-30.0, 0.0),
                PoseTarget::LookLeft => (30.0, 0.0),
                PoseTarget::LookUp => (0.0, 25.0),
                PoseTarget::LookDown => (0.0, -25.0),
            };
            *self.0.lock().unwrap() = Some(raw_pose(yaw, pitch));
        }
    }

    impl PoseEstimator for SharedPose {
        fn detect_pose(&mut self, _frame: &RawFrame) -> Result<Option<Pose>, InferenceError> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    fn spawn(
        pose: SharedPose,
        camera: FakeCamera,
        extractor: FakeExtractor,
        store: Arc<MemoryStore>,
        session: SessionConfig,
        preview_dir: Option<PathBuf>,
    ) -> Engine {
        let finalizer = Finalizer::new(
            FakeLocator::always(),
            SharedExtractor::new(extractor),
            store,
            DeclaredCount::Approved,
        );
        Engine::spawn(
            EngineParts {
                camera,
                estimator: pose,
                finalizer,
            },
            EngineSettings {
                session,
                preview_dir,
                frame_interval: Duration::from_millis(1),
            },
        )
        .unwrap()
    }

    async fn wait_for(handle: &EngineHandle, phase: Phase) -> EngineStatus {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let status = handle.status().await.unwrap();
            if status.session.phase == phase {
                return status;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {phase}, at {}", status.session.phase);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_guided_enrollment_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let pose = SharedPose::default();
        let preview_dir = std::env::temp_dir().join(format!("angler-engine-{}", std::process::id()));
        let engine = spawn(
            pose.clone(),
            FakeCamera::new(64, 48),
            FakeExtractor::new(8),
            store.clone(),
            SessionConfig::default(),
            Some(preview_dir.clone()),
        );
        let handle = engine.handle();

        assert_eq!(handle.start("Alice").await.unwrap(), PoseTarget::LookRight);
        for (i, &target) in PoseTarget::SEQUENCE.iter().enumerate() {
            pose.hold(target);
            let status = wait_for(&handle, Phase::AwaitingConfirmation).await;
            assert_eq!(status.session.target, Some(target));
            let preview = status.preview.expect("preview written");
            assert!(preview.exists());

            let approved = handle.approve().await.unwrap();
            if i + 1 < PoseTarget::SEQUENCE.len() {
                assert_eq!(
                    approved,
                    ApproveResult::Advanced { step: i + 1, target: PoseTarget::SEQUENCE[i + 1] }
                );
            } else {
                assert_eq!(approved, ApproveResult::Finalizing);
            }
        }

        let status = wait_for(&handle, Phase::Done).await;
        let summary = status.last_enrollment.expect("enrollment summary");
        assert_eq!(status.session.identity.as_ref(), Some(&summary.identity));
        assert_eq!(summary.name, "Alice");
        assert_eq!(summary.embeddings, 4);
        assert_eq!(summary.declared_image_count, 4);
        assert_eq!(store.count_identities().unwrap(), 1);
        assert_eq!(store.embeddings().len(), 4);

        drop(handle);
        engine.shutdown().await;
        let _ = std::fs::remove_dir_all(preview_dir);
    }

    #[tokio::test]
    async fn test_dark_still_rearms_and_retries() {
        let camera = FakeCamera::new(64, 48).failing_first([CaptureError::DarkFrame]);
        let captures = camera.captures();
        let pose = SharedPose::default();
        let engine = spawn(
            pose.clone(),
            camera,
            FakeExtractor::new(8),
            Arc::new(MemoryStore::new()),
            SessionConfig::default(),
            None,
        );
        let handle = engine.handle();

        handle.start("Alice").await.unwrap();
        pose.hold(PoseTarget::LookRight);
        let status = wait_for(&handle, Phase::AwaitingConfirmation).await;
        assert_eq!(status.session.step, Some(0));
        assert_eq!(captures.load(Ordering::SeqCst), 2);
        assert!(status.preview.is_none());

        drop(handle);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandon_during_finalize_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let extractor = FakeExtractor::new(8).with_delay_ms(200);
        let seen = extractor.seen_sizes();
        let pose = SharedPose::default();
        let engine = spawn(
            pose.clone(),
            FakeCamera::new(64, 48),
            extractor,
            store.clone(),
            SessionConfig {
                targets: vec![PoseTarget::LookUp],
                ..SessionConfig::default()
            },
            None,
        );
        let handle = engine.handle();

        handle.start("Alice").await.unwrap();
        pose.hold(PoseTarget::LookUp);
        wait_for(&handle, Phase::AwaitingConfirmation).await;
        assert_eq!(handle.approve().await.unwrap(), ApproveResult::Finalizing);
        assert_eq!(handle.abandon().await.unwrap(), Some(Phase::Finalizing));

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "extraction never ran");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.count_identities().unwrap(), 0);
        assert!(store.embeddings().is_empty());
        let status = handle.status().await.unwrap();
        assert_eq!(status.session.phase, Phase::Abandoned);
        assert!(status.last_enrollment.is_none());

        assert_eq!(handle.start("Bob").await.unwrap(), PoseTarget::LookUp);

        drop(handle);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_commands_out_of_order_are_refused() {
        let engine = spawn(
            SharedPose::default(),
            FakeCamera::new(64, 48),
            FakeExtractor::new(8),
            Arc::new(MemoryStore::new()),
            SessionConfig::default(),
            None,
        );
        let handle = engine.handle();

        assert!(matches!(
            handle.start("  ").await,
            Err(EngineError::Session(SessionError::EmptyName))
        ));
        assert!(matches!(
            handle.approve().await,
            Err(EngineError::Session(SessionError::InvalidState { op: "approve", .. }))
        ));
        assert_eq!(handle.abandon().await.unwrap(), None);

        handle.start("Alice").await.unwrap();
        assert!(matches!(
            handle.start("Bob").await,
            Err(EngineError::Session(SessionError::InvalidState { op: "start", .. }))
        ));

        drop(handle);
        engine.shutdown().await;
    }

    #[test]
    fn test_enrollment_finished_after_abandon_is_rolled_back() {
        let store = Arc::new(MemoryStore::new());
        let mut finalizer = Finalizer::new(
            FakeLocator::always(),
            SharedExtractor::new(FakeExtractor::new(8)),
            Arc::clone(&store),
            DeclaredCount::Approved,
        );
        let batch = EnrollmentBatch {
            name: "Alice".into(),
            frames: (0..4).map(|_| RawFrame::filled(64, 48, 100)).collect(),
        };
        // Abandon lands after the finalizer's own cancel check.
        let cancel = AtomicBool::new(false);
        let result = finalizer.finalize(&batch, &cancel);
        assert!(matches!(result, Ok(FinalizeOutcome::Enrolled(_))));
        assert_eq!(store.identities().len(), 1);

        cancel.store(true, Ordering::SeqCst);
        let result = discard_if_cancelled(finalizer.store(), result, &cancel);
        assert!(matches!(result, Ok(FinalizeOutcome::Cancelled)));
        assert!(store.identities().is_empty());
        assert!(store.embeddings().is_empty());
    }

    #[test]
    fn test_uncancelled_enrollment_is_kept() {
        let store = Arc::new(MemoryStore::new());
        let mut finalizer = Finalizer::new(
            FakeLocator::always(),
            SharedExtractor::new(FakeExtractor::new(8)),
            Arc::clone(&store),
            DeclaredCount::Approved,
        );
        let batch = EnrollmentBatch {
            name: "Bob".into(),
            frames: vec![RawFrame::filled(64, 48, 100)],
        };
        let cancel = AtomicBool::new(false);
        let result = finalizer.finalize(&batch, &cancel);
        let result = discard_if_cancelled(finalizer.store(), result, &cancel);
        assert!(matches!(result, Ok(FinalizeOutcome::Enrolled(_))));
        assert_eq!(store.identities().len(), 1);
    }

    #[test]
    fn test_latest_frame_keeps_newest() {
        let latest = LatestFrame::default();
        assert!(!latest.put(RawFrame::filled(2, 2, 0).with_sequence(1)));
        assert!(latest.put(RawFrame::filled(2, 2, 0).with_sequence(2)));
        assert_eq!(latest.take(IDLE_POLL).map(|f| f.sequence), Some(2));
        assert!(latest.take(Duration::from_millis(1)).is_none());
    }

    #[test]
    fn test_status_json_is_flat() {
        let session = CaptureSession::new(SessionConfig::default());
        let status = EngineStatus {
            session: session.status(),
            preview: None,
            last_enrollment: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["total_steps"], 4);
        assert!(json["preview"].is_null());
    }
}
