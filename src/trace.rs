//! Execution-time tracing
//!
//! Optional diagnostic checkpoints recorded while the run progresses. The
//! trace is a plain value owned by `main` and threaded through the run, never
//! ambient state, and has no effect on the computed statistics.

use std::time::Instant;

/// Ordered sequence of named wall-clock checkpoints.
#[derive(Debug)]
pub struct TimeTrace {
    enabled: bool,
    points: Vec<(Instant, String)>,
}

impl TimeTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            points: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record a checkpoint. No-op when tracing is off.
    pub fn mark(&mut self, label: &str) {
        if self.enabled {
            self.points.push((Instant::now(), label.to_string()));
        }
    }

    /// Seconds elapsed between consecutive checkpoints, labeled with the
    /// later checkpoint of each pair.
    pub fn deltas(&self) -> Vec<(f64, &str)> {
        self.points
            .windows(2)
            .map(|pair| {
                let (earlier, _) = &pair[0];
                let (later, label) = &pair[1];
                (later.duration_since(*earlier).as_secs_f64(), label.as_str())
            })
            .collect()
    }
}
