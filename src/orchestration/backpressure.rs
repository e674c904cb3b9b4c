//! Per-level failure-rate circuit breaker.
//!
//! Each level keeps a sliding window of recent task outcomes. When enough
//! of them are failures the level is paused: no new claims are dispatched
//! for it until it is resumed, while tasks already running finish.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::BackpressureConfig;

#[derive(Debug, Clone, Default)]
struct LevelWindow {
    total_tasks: usize,
    /// `true` for success.
    outcomes: VecDeque<bool>,
    paused: bool,
    successes: u32,
    failures: u32,
}

impl LevelWindow {
    fn window_failures(&self) -> usize {
        self.outcomes.iter().filter(|ok| !**ok).count()
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.window_failures() as f64 / self.outcomes.len() as f64
        }
    }

    fn push(&mut self, success: bool, window_size: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window_size {
            self.outcomes.pop_front();
        }
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
    }

    fn tripped(&self, config: &BackpressureConfig) -> bool {
        config.enabled
            && !self.paused
            && self.outcomes.len() >= config.min_samples
            && self.window_failures() >= config.min_failures
            && self.failure_rate() >= config.failure_threshold
    }

    /// Returns `true` if this call changed the state.
    fn pause(&mut self, level: u32) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        warn!(
            level,
            failure_rate = self.failure_rate(),
            samples = self.outcomes.len(),
            "Backpressure paused level"
        );
        true
    }
}

/// Point-in-time view of one level's breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelBackpressure {
    pub level: u32,
    pub total_tasks: usize,
    pub paused: bool,
    pub window_samples: usize,
    pub window_failures: usize,
    pub failure_rate: f64,
    /// Lifetime counts, not cleared by resume.
    pub successes: u32,
    pub failures: u32,
}

#[derive(Debug)]
pub struct BackpressureController {
    config: BackpressureConfig,
    levels: Mutex<HashMap<u32, LevelWindow>>,
}

impl BackpressureController {
    pub fn new(config: BackpressureConfig) -> Self {
        Self {
            config,
            levels: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn levels(&self) -> MutexGuard<'_, HashMap<u32, LevelWindow>> {
        self.levels.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_level(&self, level: u32, total_tasks: usize) {
        self.levels().entry(level).or_default().total_tasks = total_tasks;
    }

    pub fn record_success(&self, level: u32) {
        self.record(level, true);
    }

    pub fn record_failure(&self, level: u32) {
        self.record(level, false);
    }

    fn record(&self, level: u32, success: bool) {
        self.levels()
            .entry(level)
            .or_default()
            .push(success, self.config.window_size);
    }

    /// Whether the level has crossed the failure threshold and is not yet paused.
    pub fn should_pause(&self, level: u32) -> bool {
        self.levels()
            .get(&level)
            .map(|w| w.tripped(&self.config))
            .unwrap_or(false)
    }

    /// Record an outcome and pause the level if it tripped. Returns `true`
    /// when this call paused the level; concurrent callers never both see
    /// `true` for the same pause.
    pub fn observe(&self, level: u32, success: bool) -> bool {
        let mut levels = self.levels();
        let window = levels.entry(level).or_default();
        window.push(success, self.config.window_size);
        window.tripped(&self.config) && window.pause(level)
    }

    pub fn pause_level(&self, level: u32) {
        self.levels().entry(level).or_default().pause(level);
    }

    /// Unpause and clear the window so earlier failures no longer count.
    pub fn resume_level(&self, level: u32) {
        let mut levels = self.levels();
        if let Some(window) = levels.get_mut(&level) {
            window.paused = false;
            window.outcomes.clear();
            info!(level, "Backpressure resumed level");
        }
    }

    pub fn is_paused(&self, level: u32) -> bool {
        self.levels()
            .get(&level)
            .map(|w| w.paused)
            .unwrap_or(false)
    }

    /// Failure rate over the samples currently in the window.
    pub fn get_failure_rate(&self, level: u32) -> f64 {
        self.levels()
            .get(&level)
            .map(LevelWindow::failure_rate)
            .unwrap_or(0.0)
    }

    pub fn status(&self, level: u32) -> Option<LevelBackpressure> {
        self.levels().get(&level).map(|w| LevelBackpressure {
            level,
            total_tasks: w.total_tasks,
            paused: w.paused,
            window_samples: w.outcomes.len(),
            window_failures: w.window_failures(),
            failure_rate: w.failure_rate(),
            successes: w.successes,
            failures: w.failures,
        })
    }
}
