//! Progress reporting hooks.
//!
//! Rendering is a collaborator concern; the core emits events through
//! `ProgressSink`. `HumanSink` prints plain lines, `JsonSink` one object per
//! line for machine consumers.

use serde_json::json;

use crate::session::{Summary, TransferStats};

pub trait ProgressSink: Send + Sync {
    fn phase(&self, _name: &str) {}
    fn file(&self, _action: &str, _path: &str, _bytes: u64) {}
    fn deleted(&self, _path: &str) {}
    fn file_failed(&self, _detail: &str) {}
    fn summary(&self, _summary: &Summary, _stats: &TransferStats) {}
    fn warn(&self, _msg: &str) {}
}

/// Swallows everything; used under `--quiet`.
pub struct SilentSink;
impl ProgressSink for SilentSink {}

pub struct HumanSink {
    verbosity: u8,
}

impl HumanSink {
    pub fn new(verbosity: u8) -> Self {
        Self { verbosity }
    }
}

impl ProgressSink for HumanSink {
    fn phase(&self, name: &str) {
        if self.verbosity >= 2 {
            eprintln!("{name}...");
        }
    }

    fn file(&self, action: &str, path: &str, bytes: u64) {
        if self.verbosity >= 1 {
            println!("{action:>6} {path} ({bytes} bytes)");
        }
    }

    fn deleted(&self, path: &str) {
        println!("delete {path}");
    }

    fn file_failed(&self, detail: &str) {
        eprintln!("failed: {detail}");
    }

    fn summary(&self, summary: &Summary, stats: &TransferStats) {
        println!(
            "{} files examined, {} sent whole, {} by delta, {} deleted",
            stats.files_examined, stats.files_sent, stats.files_delta, stats.files_deleted
        );
        println!(
            "{} bytes raw, {} on the wire; {} ok, {} failed",
            stats.raw_bytes,
            summary.bytes_in,
            summary.ok,
            summary.failed
        );
    }

    fn warn(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }
}

pub struct JsonSink;

impl JsonSink {
    fn emit(value: serde_json::Value) {
        println!("{value}");
    }
}

impl ProgressSink for JsonSink {
    fn phase(&self, name: &str) {
        Self::emit(json!({"event": "phase", "name": name}));
    }

    fn file(&self, action: &str, path: &str, bytes: u64) {
        Self::emit(json!({"event": "file", "action": action, "path": path, "bytes": bytes}));
    }

    fn deleted(&self, path: &str) {
        Self::emit(json!({"event": "delete", "path": path}));
    }

    fn file_failed(&self, detail: &str) {
        Self::emit(json!({"event": "file_failed", "detail": detail}));
    }

    fn summary(&self, summary: &Summary, stats: &TransferStats) {
        Self::emit(json!({
            "event": "summary",
            "worker": summary,
            "client": stats,
        }));
    }

    fn warn(&self, msg: &str) {
        Self::emit(json!({"event": "warning", "message": msg}));
    }
}
