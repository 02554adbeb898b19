//! Consecutive-frame stability counter that gates still capture.

/// Default number of consecutive matching frames before a capture fires.
pub const DEFAULT_REQUIRED_STABLE: usize = 6;

/// Consecutive-match counter with one-shot firing.
///
/// A single mismatching frame resets progress to zero. After firing the
/// debouncer disarms itself and ignores frames until [`arm`](Self::arm) is
/// called again.
#[derive(Debug, Clone)]
pub struct StabilityDebouncer {
    required: usize,
    count: usize,
    armed: bool,
}

impl StabilityDebouncer {
    /// Starts disarmed. A zero requirement is treated as 1.
    pub fn new(required: usize) -> Self {
        Self {
            required: required.max(1),
            count: 0,
            armed: false,
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn arm(&mut self) {
        self.armed = true;
        self.count = 0;
    }

    pub fn disarm(&mut self) {
        self.armed = false;
        self.count = 0;
    }

    /// Record one classified frame. Returns `true` exactly once per arming,
    /// on the frame that completes the run of `required` matches.
    pub fn observe(&mut self, matched: bool) -> bool {
        if !self.armed {
            return false;
        }
        if !matched {
            self.count = 0;
            return false;
        }

        self.count = (self.count + 1).min(self.required);
        if self.count >= self.required {
            self.count = 0;
            self.armed = false;
            return true;
        }
        false
    }
}

impl Default for StabilityDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUIRED_STABLE)
    }
}
