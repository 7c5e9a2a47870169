use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use log::warn;
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Closed set of structured event types. One line per decision or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Startup,
    ScanSummary,
    Candidate,
    CandidateError,
    Skip,
    TriggerStart,
    TriggerStats,
    TriggerArm,
    TriggerFire,
    Preflight,
    Built,
    Simulate,
    Executed,
    JitoBundle,
    ConfirmError,
    RateLimit,
    OpenoceanSkip,
    Warning,
    Error,
    Exit,
    Shutdown,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Startup => "startup",
            EventType::ScanSummary => "scan_summary",
            EventType::Candidate => "candidate",
            EventType::CandidateError => "candidate_error",
            EventType::Skip => "skip",
            EventType::TriggerStart => "trigger_start",
            EventType::TriggerStats => "trigger_stats",
            EventType::TriggerArm => "trigger_arm",
            EventType::TriggerFire => "trigger_fire",
            EventType::Preflight => "preflight",
            EventType::Built => "built",
            EventType::Simulate => "simulate",
            EventType::Executed => "executed",
            EventType::JitoBundle => "jito_bundle",
            EventType::ConfirmError => "confirm_error",
            EventType::RateLimit => "rate_limit",
            EventType::OpenoceanSkip => "openocean_skip",
            EventType::Warning => "warning",
            EventType::Error => "error",
            EventType::Exit => "exit",
            EventType::Shutdown => "shutdown",
        }
    }
}

/// Append-only newline-delimited JSON event stream, optionally file-backed
/// with size-based rotation. Writes are serialized through a per-file mutex.
pub struct EventLog {
    path: Option<PathBuf>,
    rotate: bool,
    max_bytes: u64,
    max_files: u32,
    verbose: bool,
    seq: Mutex<()>,
}

impl EventLog {
    pub fn new(
        path: Option<PathBuf>,
        rotate: bool,
        max_bytes: u64,
        max_files: u32,
        verbose: bool,
    ) -> Self {
        Self {
            path,
            rotate,
            max_bytes,
            max_files,
            verbose,
            seq: Mutex::new(()),
        }
    }

    pub fn stdout(verbose: bool) -> Self {
        Self::new(None, false, 0, 0, verbose)
    }

    /// Emit one event line. `fields` must be a JSON object; `ts` and `type`
    /// are prepended here.
    pub async fn emit(&self, ty: EventType, fields: Value) {
        if !self.verbose && suppressed_when_quiet(ty, &fields) {
            return;
        }

        let mut line = json!({
            "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "type": ty.as_str(),
        });
        if let (Some(obj), Some(extra)) = (line.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        let rendered = line.to_string();

        let _guard = self.seq.lock().await;
        match &self.path {
            Some(path) => {
                if let Err(e) = self.append_line(path, &rendered) {
                    warn!("event log write failed: {e}");
                }
            }
            None => println!("{rendered}"),
        }
    }

    fn append_line(&self, path: &Path, rendered: &str) -> std::io::Result<()> {
        if self.rotate && self.max_files > 0 {
            let current = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
            if current + rendered.len() as u64 + 1 > self.max_bytes {
                rotate_files(path, self.max_files)?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{rendered}")
    }
}

/// Shift `path -> path.1 -> ... -> path.max_files`, discarding the oldest.
fn rotate_files(path: &Path, max_files: u32) -> std::io::Result<()> {
    let backup = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));
    let oldest = backup(max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..max_files).rev() {
        let from = backup(n);
        if from.exists() {
            fs::rename(&from, backup(n + 1))?;
        }
    }
    if path.exists() {
        fs::rename(path, backup(1))?;
    }
    Ok(())
}

/// Non-verbose output drops simulation chatter and quotes that did not clear
/// the profit bar.
fn suppressed_when_quiet(ty: EventType, fields: &Value) -> bool {
    match ty {
        EventType::Simulate => true,
        EventType::Candidate => fields
            .get("profitable")
            .and_then(Value::as_bool)
            .map(|p| !p)
            .unwrap_or(false),
        _ => false,
    }
}
