use std::io::Write;
use std::sync::{Mutex, PoisonError};

use lets_core::{ProgressSink, StatusDisplay, UploadProgress};

#[derive(Debug, Default)]
struct ConsoleState {
    paused: bool,
    last_message: String,
    progress_line: bool,
}

/// Status line on stderr. Stage messages are printed once each; upload progress
/// rewrites a single line while the status line is paused.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    state: Mutex<ConsoleState>,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ConsoleState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Ends any partial line so that later output starts on a fresh one.
    pub fn finish(&self) {
        self.with_state(|state| {
            if state.progress_line {
                state.progress_line = false;
                eprintln!();
            }
        });
    }
}

impl StatusDisplay for ConsoleDisplay {
    fn pause(&self) {
        self.with_state(|state| state.paused = true);
    }

    fn resume(&self) {
        self.with_state(|state| {
            state.paused = false;
            if state.progress_line {
                state.progress_line = false;
                eprintln!();
            }
        });
    }

    fn update(&self, message: &str) {
        self.with_state(|state| {
            if state.paused || state.last_message == message {
                return;
            }
            state.last_message = message.to_string();
            eprintln!("{message}");
        });
    }
}

impl ProgressSink for ConsoleDisplay {
    fn on_progress(&self, p: UploadProgress) {
        self.with_state(|state| {
            state.progress_line = true;
            let mut stderr = std::io::stderr().lock();
            let _ = write!(
                stderr,
                "\ruploading {}/{} files, {} / {}",
                p.files_done,
                p.files_total,
                human_bytes(p.bytes_consumed),
                human_bytes(p.bytes_total)
            );
            let _ = stderr.flush();
        });
    }
}

/// `--events` output: one JSON object per line on stdout.
#[derive(Debug)]
pub struct NdjsonEvents {
    run_id: String,
}

impl NdjsonEvents {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn emit(&self, mut event: serde_json::Value) {
        if let Some(obj) = event.as_object_mut() {
            obj.insert("runId".to_string(), serde_json::json!(self.run_id));
        }
        println!("{event}");
    }
}

impl StatusDisplay for NdjsonEvents {
    fn pause(&self) {}

    fn resume(&self) {}

    fn update(&self, message: &str) {
        self.emit(serde_json::json!({
            "type": "deploy.stage",
            "message": message,
        }));
    }
}

impl ProgressSink for NdjsonEvents {
    fn on_progress(&self, p: UploadProgress) {
        self.emit(serde_json::json!({
            "type": "upload.progress",
            "phase": p.phase,
            "filesTotal": p.files_total,
            "filesDone": p.files_done,
            "bytesConsumed": p.bytes_consumed,
            "bytesTotal": p.bytes_total,
        }));
    }
}

pub fn human_bytes(bytes: i64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_unit() {
        assert_eq!(human_bytes(0), "0 B");
        assert_eq!(human_bytes(1023), "1023 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn paused_console_drops_stage_updates() {
        let display = ConsoleDisplay::new();
        display.pause();
        display.update("NetworkStage: a, PackerStage: b, Status: c");
        assert!(display.with_state(|s| s.last_message.is_empty()));

        display.resume();
        display.update("NetworkStage: a, PackerStage: b, Status: c");
        assert_eq!(
            display.with_state(|s| s.last_message.clone()),
            "NetworkStage: a, PackerStage: b, Status: c"
        );
    }
}
