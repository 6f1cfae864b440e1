//! Focus-lock state rebuilt from the board's message stream.

use crate::message::{FocusMessage, Stats};
use mm_core::device::Reading;
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusMode {
    Locked,
    Unlocked,
    Calibrating,
    LightProfile,
}

impl FocusMode {
    pub fn label(&self) -> &'static str {
        match self {
            FocusMode::Locked => "Locked",
            FocusMode::Unlocked => "Unlocked",
            FocusMode::Calibrating => "Calibrating",
            FocusMode::LightProfile => "Light Profile",
        }
    }
}

impl fmt::Display for FocusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The most recent offsets, newest first.
#[derive(Debug, Clone)]
pub struct OffsetWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl OffsetWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, offset: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_back();
        }
        self.values.push_front(offset);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sample standard deviation (n - 1). `None` until two offsets are held.
    pub fn std_dev(&self) -> Option<f64> {
        let n = self.values.len();
        if n < 2 {
            return None;
        }
        let mean = self.values.iter().sum::<f64>() / n as f64;
        let squares: f64 = self.values.iter().map(|v| (v - mean).powi(2)).sum();
        Some((squares / (n - 1) as f64).sqrt())
    }
}

/// Everything the host can read about the focus lock.
#[derive(Debug, Clone)]
pub struct FocusState {
    pub mode: FocusMode,
    /// Set by the host when it locks; `STATS:` lines report `Locked` only
    /// while this is set.
    pub continuous: bool,
    pub auto_exposure: bool,
    pub stats: Option<Stats>,
    pub offsets: OffsetWindow,
    pub version: Option<String>,
    pub slope: Option<f64>,
    pub intercept: Option<f64>,
    pub gain: Option<f64>,
    pub microns_per_volt: Option<f64>,
    pub residuals: Option<f64>,
    pub calibration: Vec<(f64, f64)>,
    pub light_profile: Vec<i64>,
    pub last_info: Option<String>,
    pub last_error: Option<String>,
}

impl FocusState {
    pub fn new(offset_window: usize) -> Self {
        Self {
            mode: FocusMode::Unlocked,
            continuous: false,
            auto_exposure: true,
            stats: None,
            offsets: OffsetWindow::new(offset_window),
            version: None,
            slope: None,
            intercept: None,
            gain: None,
            microns_per_volt: None,
            residuals: None,
            calibration: Vec::new(),
            light_profile: Vec::new(),
            last_info: None,
            last_error: None,
        }
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.offsets.std_dev()
    }

    /// Fold one message into the state. A `STATS:` line also yields a reading.
    pub fn apply(&mut self, message: &FocusMessage) -> Option<Reading> {
        match message {
            FocusMessage::Stats(stats) => {
                self.offsets.push(stats.offset);
                self.slope = Some(stats.slope);
                self.mode = if self.continuous {
                    FocusMode::Locked
                } else {
                    FocusMode::Unlocked
                };
                self.stats = Some(stats.clone());
                return Some(self.reading(stats));
            }
            FocusMessage::LightProfile { profile, .. } => {
                self.light_profile = profile.clone();
                self.mode = FocusMode::LightProfile;
            }
            FocusMessage::Version(version) => self.version = Some(version.clone()),
            FocusMessage::CalibrationPoint { dau, pixel } => {
                self.calibration.push((*dau, *pixel));
                self.mode = FocusMode::Calibrating;
            }
            FocusMessage::CalibrationActivated => self.mode = FocusMode::Calibrating,
            FocusMessage::ReturningToDefault => self.mode = FocusMode::Unlocked,
            FocusMessage::Intercept(v) => self.intercept = Some(*v),
            FocusMessage::Slope(v) => self.slope = Some(*v),
            FocusMessage::Gain(v) => self.gain = Some(*v),
            FocusMessage::MicronsPerVolt(v) => self.microns_per_volt = Some(*v),
            FocusMessage::Residuals(v) => self.residuals = Some(*v),
            FocusMessage::Info(text) => self.last_info = Some(text.clone()),
            FocusMessage::Error(text) => self.last_error = Some(text.clone()),
            FocusMessage::Unrecognized(_) => {}
        }
        None
    }

    fn reading(&self, stats: &Stats) -> Reading {
        let mut reading = Reading::new()
            .with("Offset", stats.offset)
            .with("Dac", stats.dac)
            .with("Adc", stats.adc)
            .with("Exposure", stats.exposure);
        if let Some(sd) = self.std_dev() {
            reading = reading.with("StdDev", sd);
        }
        reading.with("Mode", self.mode.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(offset: f64) -> FocusMessage {
        FocusMessage::Stats(Stats {
            start_time: 0,
            loop_time: 15,
            light_min: 100,
            light_max: 900,
            dac: 2048.0,
            offset,
            slope: 0.5,
            exposure: 10000,
            adc: 512.0,
            diff_adc: 3.0,
        })
    }

    #[test]
    fn sample_std_dev_over_window() {
        let mut window = OffsetWindow::new(3);
        assert_eq!(window.std_dev(), None);
        window.push(100.0);
        assert_eq!(window.std_dev(), None);
        for v in [10.0, 12.0, 14.0] {
            window.push(v);
        }
        // 100 fell out of the window
        assert_eq!(window.len(), 3);
        assert!((window.std_dev().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn stats_mode_follows_continuous_flag() {
        let mut state = FocusState::new(10);
        state.apply(&stats(1.0));
        assert_eq!(state.mode, FocusMode::Unlocked);

        state.continuous = true;
        let reading = state.apply(&stats(3.0)).unwrap();
        assert_eq!(state.mode, FocusMode::Locked);
        assert_eq!(reading.get("Mode"), Some(&"Locked".into()));
        assert!(reading.get("StdDev").is_some());
    }

    #[test]
    fn calibration_messages_switch_mode() {
        let mut state = FocusState::new(10);
        assert!(state.apply(&FocusMessage::CalibrationActivated).is_none());
        assert_eq!(state.mode, FocusMode::Calibrating);

        state.apply(&FocusMessage::CalibrationPoint {
            dau: 1000.0,
            pixel: 40.0,
        });
        assert_eq!(state.calibration, vec![(1000.0, 40.0)]);

        state.apply(&FocusMessage::ReturningToDefault);
        assert_eq!(state.mode, FocusMode::Unlocked);
    }
}
