//! Per-kernel dispatch timings.

use std::fmt;
use std::time::Duration;

/// Number of recent dispatch durations kept.
pub const MAX_TIMINGS: usize = 100;

/// Ring of the last [`MAX_TIMINGS`] dispatch durations plus a run counter.
#[derive(Debug, Clone, Default)]
pub struct RunTimings {
    timings: Vec<Duration>,
    total_runs: u64,
}

impl RunTimings {
    pub fn record(&mut self, elapsed: Duration) {
        let slot = (self.total_runs % MAX_TIMINGS as u64) as usize;
        if slot < self.timings.len() {
            self.timings[slot] = elapsed;
        } else {
            self.timings.push(elapsed);
        }
        self.total_runs += 1;
    }

    pub fn summarize(&self, name: &str) -> KernelStats {
        let millis: Vec<f64> = self
            .timings
            .iter()
            .map(|d| d.as_secs_f64() * 1e3)
            .collect();
        let n = millis.len();
        let (mean, std_dev) = if n == 0 {
            (0.0, 0.0)
        } else {
            let mean = millis.iter().sum::<f64>() / n as f64;
            let denom = (if n > 1 { n - 1 } else { n }) as f64;
            let var = millis.iter().map(|t| (t - mean) * (t - mean)).sum::<f64>() / denom;
            (mean, var.sqrt())
        };
        KernelStats {
            name: name.to_string(),
            runs: self.total_runs,
            samples: n,
            mean_ms: mean,
            std_dev_ms: std_dev,
        }
    }
}

/// Summary of a kernel's recent dispatch times, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelStats {
    pub name: String,
    /// Dispatches since creation.
    pub runs: u64,
    /// Durations the mean and deviation are computed over.
    pub samples: usize,
    pub mean_ms: f64,
    pub std_dev_ms: f64,
}

impl KernelStats {
    /// One aligned line, e.g. `"                   add:   3 ±   1        #runs:  12"`.
    pub fn pretty(&self) -> String {
        format!(
            "{:>25}:{:>4.0} ±{:>4.0}        #runs:{:>4}",
            self.name, self.mean_ms, self.std_dev_ms, self.runs
        )
    }
}

impl fmt::Display for KernelStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let s = RunTimings::default().summarize("k");
        assert_eq!(s.runs, 0);
        assert_eq!(s.mean_ms, 0.0);
        assert_eq!(s.std_dev_ms, 0.0);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let mut t = RunTimings::default();
        for ms in [2u64, 4, 4, 4, 5, 5, 7, 9] {
            t.record(Duration::from_millis(ms));
        }
        let s = t.summarize("k");
        assert_eq!(s.runs, 8);
        assert!((s.mean_ms - 5.0).abs() < 1e-9);
        // sample variance 32 / 7
        assert!((s.std_dev_ms - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_ring_keeps_last_hundred() {
        let mut t = RunTimings::default();
        for _ in 0..MAX_TIMINGS {
            t.record(Duration::from_millis(1));
        }
        for _ in 0..MAX_TIMINGS {
            t.record(Duration::from_millis(3));
        }
        let s = t.summarize("k");
        assert_eq!(s.runs, 200);
        assert_eq!(s.samples, MAX_TIMINGS);
        assert!((s.mean_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_pretty() {
        let s = KernelStats {
            name: "add".into(),
            runs: 12,
            samples: 12,
            mean_ms: 3.2,
            std_dev_ms: 0.6,
        };
        let line = s.pretty();
        assert!(line.ends_with("add:   3 ±   1        #runs:  12"));
        assert!(line.starts_with(&" ".repeat(22)));
    }
}
