//! Guided capture session: the state machine that walks the user through each
//! pose, owns the smoothing windows and debouncer, and collects approved
//! stills for enrollment.
//!
//! Transitions:
//! - `Idle` → `Armed(0)` on [`CaptureSession::start`]
//! - `Armed(i)` → `CaptureInFlight(i)` once the pose has been held
//! - `CaptureInFlight(i)` → `AwaitingConfirmation(i)` on a still, back to `Armed(i)` on failure
//! - `AwaitingConfirmation(i)` → `Armed(i + 1)` or `Finalizing` on approve, `Armed(i)` on retake
//! - `Finalizing` → `Done` | `Failed`
//!
//! Every transition goes through a method on [`CaptureSession`]; the state is
//! never shared, so the owner decides which context drives it.

use crate::capability::CaptureError;
use crate::classifier::{self, Classification, Thresholds};
use crate::debounce::{StabilityDebouncer, DEFAULT_REQUIRED_STABLE};
use crate::frame::RawFrame;
use crate::smoother::{PoseSmoother, DEFAULT_WINDOW};
use crate::types::{IdentityId, Pose, PoseTarget};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("session has no pose targets")]
    NoTargets,
    #[error("cannot {op} while {phase}")]
    InvalidState { op: &'static str, phase: Phase },
    #[error("previous session still has a capture in flight")]
    CapturePending,
}

/// Tunables for one capture session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub thresholds: Thresholds,
    /// Smoothing window length per axis.
    pub window: usize,
    /// Consecutive matching frames required before a capture.
    pub required_stable: usize,
    pub targets: Vec<PoseTarget>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            window: DEFAULT_WINDOW,
            required_stable: DEFAULT_REQUIRED_STABLE,
            targets: PoseTarget::SEQUENCE.to_vec(),
        }
    }
}

/// Coarse session phase, without the data each state carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Armed,
    CaptureInFlight,
    AwaitingConfirmation,
    Finalizing,
    Done,
    Failed,
    Abandoned,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::Armed => "armed",
            Phase::CaptureInFlight => "capture in flight",
            Phase::AwaitingConfirmation => "awaiting confirmation",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Idle,
    Armed { step: usize },
    CaptureInFlight { step: usize },
    AwaitingConfirmation { step: usize, frame: RawFrame },
    Finalizing,
    /// `identity` is `None` when no approved frame yielded a usable face.
    Done { identity: Option<IdentityId> },
    Failed { reason: String },
    /// `capture_pending` stays set until the in-flight still arrives and is discarded.
    Abandoned { capture_pending: bool },
}

impl SessionState {
    pub fn phase(&self) -> Phase {
        match self {
            SessionState::Idle => Phase::Idle,
            SessionState::Armed { .. } => Phase::Armed,
            SessionState::CaptureInFlight { .. } => Phase::CaptureInFlight,
            SessionState::AwaitingConfirmation { .. } => Phase::AwaitingConfirmation,
            SessionState::Finalizing => Phase::Finalizing,
            SessionState::Done { .. } => Phase::Done,
            SessionState::Failed { .. } => Phase::Failed,
            SessionState::Abandoned { .. } => Phase::Abandoned,
        }
    }

    fn step(&self) -> Option<usize> {
        match self {
            SessionState::Armed { step }
            | SessionState::CaptureInFlight { step }
            | SessionState::AwaitingConfirmation { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// What happened to one live frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Session is not armed; the frame was not classified.
    Dropped,
    /// No face on this frame. Stability progress is left as it was.
    Skipped { target: PoseTarget, stable_count: usize },
    Tracking {
        target: PoseTarget,
        classification: Classification,
        stable_count: usize,
    },
    /// The pose held long enough; the owner must request a still capture.
    CaptureRequested { step: usize, target: PoseTarget },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    AwaitingConfirmation { step: usize, target: PoseTarget },
    /// Capture failed; the same step is armed again.
    Rearmed { step: usize, error: CaptureError },
    /// The session was abandoned while the capture was in flight.
    Discarded,
}

/// Approved stills ready for the finalizer.
#[derive(Debug, Clone)]
pub struct EnrollmentBatch {
    pub name: String,
    pub frames: Vec<RawFrame>,
}

#[derive(Debug, Clone)]
pub enum Approval {
    Advanced { step: usize, target: PoseTarget },
    Finalize(EnrollmentBatch),
}

/// Serializable snapshot of a session for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: Phase,
    pub name: Option<String>,
    pub step: Option<usize>,
    pub total_steps: usize,
    pub target: Option<PoseTarget>,
    pub instruction: Option<String>,
    pub stable_count: usize,
    pub required_stable: usize,
    pub approved: usize,
    pub identity: Option<IdentityId>,
    pub error: Option<String>,
}

/// One guided multi-pose enrollment attempt.
pub struct CaptureSession {
    config: SessionConfig,
    name: Option<String>,
    state: SessionState,
    smoother: PoseSmoother,
    debouncer: StabilityDebouncer,
    approved: Vec<RawFrame>,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Self {
        let smoother = PoseSmoother::new(config.window);
        let debouncer = StabilityDebouncer::new(config.required_stable);
        Self {
            config,
            name: None,
            state: SessionState::Idle,
            smoother,
            debouncer,
            approved: Vec::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn smoother(&self) -> &PoseSmoother {
        &self.smoother
    }

    /// True whenever live frames must be dropped without classification.
    pub fn is_paused(&self) -> bool {
        !matches!(self.state, SessionState::Armed { .. })
    }

    pub fn current_target(&self) -> Option<PoseTarget> {
        self.state.step().and_then(|i| self.config.targets.get(i).copied())
    }

    /// The still awaiting the user's decision, if any.
    pub fn pending_frame(&self) -> Option<&RawFrame> {
        match &self.state {
            SessionState::AwaitingConfirmation { frame, .. } => Some(frame),
            _ => None,
        }
    }

    /// Begin (or restart) a session for `name`.
    ///
    /// Allowed from `Idle` and from any terminal state. Clears the windows,
    /// the approved frames and the stability counter.
    pub fn start(&mut self, name: &str) -> Result<PoseTarget, SessionError> {
        match &self.state {
            SessionState::Idle
            | SessionState::Done { .. }
            | SessionState::Failed { .. }
            | SessionState::Abandoned { capture_pending: false } => {}
            SessionState::Abandoned { capture_pending: true } => {
                return Err(SessionError::CapturePending)
            }
            other => {
                return Err(SessionError::InvalidState {
                    op: "start",
                    phase: other.phase(),
                })
            }
        }

        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        let first = *self.config.targets.first().ok_or(SessionError::NoTargets)?;

        self.name = Some(name.to_string());
        self.smoother.clear();
        self.approved.clear();
        self.debouncer.arm();
        self.state = SessionState::Armed { step: 0 };

        tracing::info!(name, steps = self.config.targets.len(), target = %first, "session started");
        Ok(first)
    }

    /// Feed the pose detected on one live frame (`None` when no face was found).
    pub fn on_pose(&mut self, pose: Option<&Pose>) -> FrameOutcome {
        let SessionState::Armed { step } = self.state else {
            return FrameOutcome::Dropped;
        };
        let target = self.config.targets[step];
        let Some(pose) = pose else {
            tracing::trace!(step, "no face on frame, skipped");
            return FrameOutcome::Skipped {
                target,
                stable_count: self.debouncer.count(),
            };
        };

        let classification = classifier::classify(
            Some(pose),
            target,
            &mut self.smoother,
            &self.config.thresholds,
        );

        if self.debouncer.observe(classification.is_match()) {
            self.smoother.clear();
            self.state = SessionState::CaptureInFlight { step };
            tracing::info!(step, target = %target, "stable pose reached, capture requested");
            return FrameOutcome::CaptureRequested { step, target };
        }

        if let Classification::Rejected(reason) = classification {
            tracing::trace!(?reason, "frame rejected");
        }

        FrameOutcome::Tracking {
            target,
            classification,
            stable_count: self.debouncer.count(),
        }
    }

    /// Deliver the result of the still capture requested by [`on_pose`](Self::on_pose).
    pub fn on_capture(&mut self, result: Result<RawFrame, CaptureError>) -> Result<CaptureOutcome, SessionError> {
        match self.state {
            SessionState::CaptureInFlight { step } => {
                let target = self.config.targets[step];
                match result {
                    Ok(frame) => {
                        tracing::info!(step, target = %target, width = frame.width, height = frame.height, "still captured");
                        self.state = SessionState::AwaitingConfirmation { step, frame };
                        Ok(CaptureOutcome::AwaitingConfirmation { step, target })
                    }
                    Err(error) => {
                        tracing::warn!(step, target = %target, %error, "still capture failed, re-arming");
                        self.state = SessionState::Armed { step };
                        self.debouncer.arm();
                        Ok(CaptureOutcome::Rearmed { step, error })
                    }
                }
            }
            SessionState::Abandoned { capture_pending: true } => {
                tracing::info!(ok = result.is_ok(), "discarding capture from abandoned session");
                self.state = SessionState::Abandoned { capture_pending: false };
                Ok(CaptureOutcome::Discarded)
            }
            ref other => Err(SessionError::InvalidState {
                op: "accept a capture",
                phase: other.phase(),
            }),
        }
    }

    /// Keep the pending still and move on. On the last step the whole batch is
    /// handed back for finalization.
    pub fn approve(&mut self) -> Result<Approval, SessionError> {
        let (step, frame) = match std::mem::replace(&mut self.state, SessionState::Finalizing) {
            SessionState::AwaitingConfirmation { step, frame } => (step, frame),
            other => {
                let phase = other.phase();
                self.state = other;
                return Err(SessionError::InvalidState { op: "approve", phase });
            }
        };

        self.approved.push(frame);
        self.smoother.clear();

        let next = step + 1;
        if next < self.config.targets.len() {
            let target = self.config.targets[next];
            self.state = SessionState::Armed { step: next };
            self.debouncer.arm();
            tracing::info!(step = next, target = %target, "capture approved, next pose");
            return Ok(Approval::Advanced { step: next, target });
        }

        self.debouncer.disarm();
        let batch = EnrollmentBatch {
            name: self.name.clone().unwrap_or_default(),
            frames: std::mem::take(&mut self.approved),
        };
        tracing::info!(frames = batch.frames.len(), "last capture approved, finalizing");
        Ok(Approval::Finalize(batch))
    }

    /// Discard the pending still and re-arm the same step. The smoothing
    /// windows are left as they are.
    pub fn retake(&mut self) -> Result<PoseTarget, SessionError> {
        match self.state {
            SessionState::AwaitingConfirmation { step, .. } => {
                let target = self.config.targets[step];
                self.state = SessionState::Armed { step };
                self.debouncer.arm();
                tracing::info!(step, target = %target, "capture rejected, retaking");
                Ok(target)
            }
            ref other => Err(SessionError::InvalidState {
                op: "retake",
                phase: other.phase(),
            }),
        }
    }

    /// Record the finalizer's result. Ignored once the session was abandoned.
    pub fn finish(&mut self, result: Result<Option<IdentityId>, String>) -> Result<Phase, SessionError> {
        match self.state {
            SessionState::Finalizing => {}
            SessionState::Abandoned { .. } => return Ok(Phase::Abandoned),
            ref other => {
                return Err(SessionError::InvalidState {
                    op: "finish",
                    phase: other.phase(),
                })
            }
        }

        self.state = match result {
            Ok(identity) => {
                tracing::info!(identity = ?identity, "session done");
                SessionState::Done { identity }
            }
            Err(reason) => {
                tracing::warn!(%reason, "session failed");
                SessionState::Failed { reason }
            }
        };
        Ok(self.phase())
    }

    /// Give up on the session. Returns the phase that was abandoned, or `None`
    /// if there was nothing in progress.
    pub fn abandon(&mut self) -> Option<Phase> {
        let previous = self.phase();
        let capture_pending = match self.state {
            SessionState::Idle
            | SessionState::Done { .. }
            | SessionState::Failed { .. }
            | SessionState::Abandoned { .. } => return None,
            SessionState::CaptureInFlight { .. } => true,
            _ => false,
        };

        self.state = SessionState::Abandoned { capture_pending };
        self.smoother.clear();
        self.approved.clear();
        self.debouncer.disarm();
        tracing::info!(%previous, capture_pending, "session abandoned");
        Some(previous)
    }

    pub fn status(&self) -> SessionStatus {
        let target = self.current_target();
        let (identity, error) = match &self.state {
            SessionState::Done { identity } => (identity.clone(), None),
            SessionState::Failed { reason } => (None, Some(reason.clone())),
            _ => (None, None),
        };
        SessionStatus {
            phase: self.phase(),
            name: self.name.clone(),
            step: self.state.step(),
            total_steps: self.config.targets.len(),
            target,
            instruction: target.map(|t| t.instruction().to_string()),
            stable_count: self.debouncer.count(),
            required_stable: self.debouncer.required(),
            approved: self.approved.len(),
            identity,
            error,
        }
    }
}
