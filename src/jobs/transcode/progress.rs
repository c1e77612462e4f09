use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Progress of one encode, derived from the encoder's own timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub elapsed_seconds: f64,
    /// 0 until the input duration has been reported
    pub total_seconds: f64,
    /// `elapsed / total`, clamped to `[0, 1]`
    pub fraction: f64,
}

fn duration_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration: (\d{2}:\d{2}:\d{2}\.\d{2})").expect("duration pattern is valid")
    })
}

fn time_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"time=(\d{2}:\d{2}:\d{2}\.\d{2})").expect("time pattern is valid")
    })
}

/// Line-by-line reducer over the encoder's diagnostic stream. One instance per job.
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_seconds: f64,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }

    /// Consume one line. The first `Duration:` latches the total; every `time=` after
    /// that yields a sample. Anything else yields nothing.
    pub fn feed(&mut self, line: &str) -> Option<ProgressSample> {
        if self.total_seconds == 0.0 {
            if let Some(caps) = duration_pattern().captures(line) {
                self.total_seconds = parse_time(&caps[1]);
            }
        }

        let caps = time_pattern().captures(line)?;
        if self.total_seconds <= 0.0 {
            return None;
        }

        let elapsed = parse_time(&caps[1]);
        Some(ProgressSample {
            elapsed_seconds: elapsed,
            total_seconds: self.total_seconds,
            fraction: (elapsed / self.total_seconds).clamp(0.0, 1.0),
        })
    }
}

/// Parse `HH:MM:SS.ff` into seconds, 0 when there aren't exactly three segments.
///
/// The fractional part is read as hundredths, which is what ffmpeg prints. Longer
/// fractions would be misread; this is kept as-is to match historical output.
pub fn parse_time(t: &str) -> f64 {
    let parts: Vec<&str> = t.split(':').collect();
    if parts.len() != 3 {
        return 0.0;
    }

    let num = |s: &str| s.trim().parse::<u64>().unwrap_or(0);
    let hours = num(parts[0]);
    let minutes = num(parts[1]);
    let (secs, hundredths) = match parts[2].split_once('.') {
        Some((s, frac)) => (num(s), num(frac)),
        None => (num(parts[2]), 0),
    };

    let whole = hours
        .saturating_mul(3600)
        .saturating_add(minutes.saturating_mul(60))
        .saturating_add(secs);
    whole as f64 + hundredths as f64 / 100.0
}
