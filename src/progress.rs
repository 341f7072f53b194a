//! Stage progress reporting.
//!
//! Reports observable progress while a task runs so an operator watching
//! `curator run-task` in a terminal sees which stage is active and how far
//! along it is. Progress is emitted on **stderr** so stdout remains
//! parseable; detached runs use [`NoProgress`] and rely on the log file.

use std::io::Write;

/// Pipeline stage, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    FetchSessions,
    Sample,
    Download,
    Upload,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::FetchSessions => "fetch",
            Stage::Sample => "sample",
            Stage::Download => "download",
            Stage::Upload => "upload",
        }
    }

    fn ordinal(self) -> u8 {
        match self {
            Stage::FetchSessions => 1,
            Stage::Sample => 1,
            Stage::Download => 2,
            Stage::Upload => 3,
        }
    }
}

#[derive(Clone, Debug)]
pub enum StageProgressEvent {
    /// A stage began; `total` is known for download and upload.
    Started { stage: Stage, total: Option<u64> },
    /// `n` of `total` items processed.
    Advanced { stage: Stage, n: u64, total: u64 },
    /// A stage finished with `count` items produced.
    Finished { stage: Stage, count: u64 },
}

pub trait StageProgressReporter: Send + Sync {
    fn report(&self, event: StageProgressEvent);
}

/// Human-friendly progress on stderr: "[2/3] download  12 / 40".
pub struct StderrProgress;

impl StageProgressReporter for StderrProgress {
    fn report(&self, event: StageProgressEvent) {
        let line = match &event {
            StageProgressEvent::Started { stage, total } => match total {
                Some(t) => format!(
                    "[{}/3] {}  starting  {} items\n",
                    stage.ordinal(),
                    stage.label(),
                    format_number(*t)
                ),
                None => format!("[{}/3] {}  starting...\n", stage.ordinal(), stage.label()),
            },
            StageProgressEvent::Advanced { stage, n, total } => format!(
                "[{}/3] {}  {} / {}\n",
                stage.ordinal(),
                stage.label(),
                format_number(*n),
                format_number(*total)
            ),
            StageProgressEvent::Finished { stage, count } => format!(
                "[{}/3] {}  done  {}\n",
                stage.ordinal(),
                stage.label(),
                format_number(*count)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageProgressReporter for JsonProgress {
    fn report(&self, event: StageProgressEvent) {
        let obj = match &event {
            StageProgressEvent::Started { stage, total } => serde_json::json!({
                "event": "stage_started",
                "stage": stage.label(),
                "total": total,
            }),
            StageProgressEvent::Advanced { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage.label(),
                "n": n,
                "total": total,
            }),
            StageProgressEvent::Finished { stage, count } => serde_json::json!({
                "event": "stage_finished",
                "stage": stage.label(),
                "count": count,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageProgressReporter for NoProgress {
    fn report(&self, _event: StageProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StageProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn upload_is_the_third_stage() {
        assert_eq!(Stage::Upload.ordinal(), 3);
        assert_eq!(Stage::Download.label(), "download");
    }
}
