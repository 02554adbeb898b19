//! Moving-average smoothing over the three head-pose axes.

use std::collections::VecDeque;

/// Default number of samples kept per axis.
pub const DEFAULT_WINDOW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Yaw,
    Pitch,
    Roll,
}

/// Fixed-capacity FIFO windows for yaw, pitch and roll.
#[derive(Debug, Clone)]
pub struct PoseSmoother {
    capacity: usize,
    yaw: VecDeque<f32>,
    pitch: VecDeque<f32>,
    roll: VecDeque<f32>,
}

impl PoseSmoother {
    /// A zero capacity is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            yaw: VecDeque::with_capacity(capacity + 1),
            pitch: VecDeque::with_capacity(capacity + 1),
            roll: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, axis: Axis, value: f32) {
        let capacity = self.capacity;
        let window = self.window_mut(axis);
        window.push_back(value);
        while window.len() > capacity {
            window.pop_front();
        }
    }

    /// Arithmetic mean of the window, 0.0 when empty.
    pub fn average(&self, axis: Axis) -> f32 {
        let window = self.window(axis);
        if window.is_empty() {
            return 0.0;
        }
        let sum: f64 = window.iter().map(|&v| v as f64).sum();
        (sum / window.len() as f64) as f32
    }

    pub fn len(&self, axis: Axis) -> usize {
        self.window(axis).len()
    }

    pub fn is_empty(&self) -> bool {
        self.yaw.is_empty() && self.pitch.is_empty() && self.roll.is_empty()
    }

    /// Drop every sample on all three axes.
    pub fn clear(&mut self) {
        self.yaw.clear();
        self.pitch.clear();
        self.roll.clear();
    }

    fn window(&self, axis: Axis) -> &VecDeque<f32> {
        match axis {
            Axis::Yaw => &self.yaw,
            Axis::Pitch => &self.pitch,
            Axis::Roll => &self.roll,
        }
    }

    fn window_mut(&mut self, axis: Axis) -> &mut VecDeque<f32> {
        match axis {
            Axis::Yaw => &mut self.yaw,
            Axis::Pitch => &mut self.pitch,
            Axis::Roll => &mut self.roll,
        }
    }
}

impl Default for PoseSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_average_is_zero() {
        let s = PoseSmoother::default();
        assert_eq!(s.average(Axis::Yaw), 0.0);
        assert!(s.is_empty());
    }

    #[test]
    fn test_window_never_exceeds_capacity() {
        let mut s = PoseSmoother::new(5);
        for i in 0..50 {
            s.push(Axis::Pitch, i as f32);
            assert!(s.len(Axis::Pitch) <= 5);
        }
        assert_eq!(s.len(Axis::Pitch), 5);
    }

    #[test]
    fn test_average_ignores_evicted_history() {
        let mut s = PoseSmoother::new(5);
        for v in [1000.0, -1000.0, 500.0] {
            s.push(Axis::Yaw, v);
        }
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            s.push(Axis::Yaw, v);
        }
        assert!((s.average(Axis::Yaw) - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_partial_window_average() {
        let mut s = PoseSmoother::new(5);
        s.push(Axis::Roll, 4.0);
        s.push(Axis::Roll, 8.0);
        assert!((s.average(Axis::Roll) - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_axes_are_independent() {
        let mut s = PoseSmoother::new(3);
        s.push(Axis::Yaw, 10.0);
        s.push(Axis::Pitch, -10.0);
        assert!((s.average(Axis::Yaw) - 10.0).abs() < 1e-6);
        assert!((s.average(Axis::Pitch) + 10.0).abs() < 1e-6);
        assert_eq!(s.len(Axis::Roll), 0);
    }

    #[test]
    fn test_clear_resets_all_axes() {
        let mut s = PoseSmoother::new(3);
        s.push(Axis::Yaw, 1.0);
        s.push(Axis::Pitch, 1.0);
        s.push(Axis::Roll, 1.0);
        s.clear();
        assert!(s.is_empty());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut s = PoseSmoother::new(0);
        s.push(Axis::Yaw, 1.0);
        s.push(Axis::Yaw, 3.0);
        assert_eq!(s.capacity(), 1);
        assert!((s.average(Axis::Yaw) - 3.0).abs() < 1e-6);
    }
}
