//! Per-stage wall-clock timings.

use std::time::{Duration, Instant};

/// Timing of one stage or worker step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTiming {
    /// Started but not finished yet.
    Running(Instant),
    Finished(Duration),
}

/// Named timings in the order the stages started.
#[derive(Debug, Clone, Default)]
pub struct StageTimings {
    entries: Vec<(String, StageTiming)>,
}

impl StageTimings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the timer for `name`.
    pub fn start(&mut self, name: &str) {
        self.start_at(name, Instant::now());
    }

    fn start_at(&mut self, name: &str, at: Instant) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, timing)) => *timing = StageTiming::Running(at),
            None => self
                .entries
                .push((name.to_string(), StageTiming::Running(at))),
        }
    }

    /// Stop the timer for `name` and return its duration.
    ///
    /// Returns `None` if `name` was never started or already finished.
    pub fn finish(&mut self, name: &str) -> Option<Duration> {
        let (_, timing) = self.entries.iter_mut().find(|(n, _)| n == name)?;
        match *timing {
            StageTiming::Running(started) => {
                let elapsed = started.elapsed();
                *timing = StageTiming::Finished(elapsed);
                Some(elapsed)
            }
            StageTiming::Finished(_) => None,
        }
    }

    /// Close every running entry with its elapsed time up to `now`.
    ///
    /// Used when a load is cancelled or fails mid-stage.
    pub fn finalize_running(&mut self, now: Instant) {
        for (_, timing) in &mut self.entries {
            if let StageTiming::Running(started) = *timing {
                *timing = StageTiming::Finished(now.saturating_duration_since(started));
            }
        }
    }

    /// Duration of a finished entry.
    pub fn get(&self, name: &str) -> Option<Duration> {
        self.entries.iter().find_map(|(n, timing)| match timing {
            StageTiming::Finished(d) if n == name => Some(*d),
            _ => None,
        })
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, timing)| n == name && matches!(timing, StageTiming::Running(_)))
    }

    /// Append entries from another set (worker steps into stage timings).
    pub fn merge(&mut self, other: StageTimings) {
        for (name, timing) in other.entries {
            match self.entries.iter_mut().find(|(n, _)| *n == name) {
                Some((_, existing)) => *existing = timing,
                None => self.entries.push((name, timing)),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, StageTiming)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), *t))
    }

    /// Sum of all finished entries.
    pub fn total(&self) -> Duration {
        self.entries
            .iter()
            .filter_map(|(_, timing)| match timing {
                StageTiming::Finished(d) => Some(*d),
                StageTiming::Running(_) => None,
            })
            .sum()
    }

    /// One-line summary, e.g. `LoadingMetadata=12.3ms, Finalizing=0.1ms`.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|(name, timing)| match timing {
                StageTiming::Finished(d) => {
                    format!("{name}={:.1}ms", d.as_secs_f64() * 1000.0)
                }
                StageTiming::Running(_) => format!("{name}=running"),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
