use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Hook for the logging backend. Default is no-op; `TextLogger` appends
/// timestamped lines to a file.
pub trait Logger: Send + Sync {
    fn start(&self, _sources: &[std::path::PathBuf], _dest: &str) {}
    fn sent(&self, _path: &str, _bytes: u64) {}
    fn delta(&self, _path: &str, _literal_bytes: u64, _copied_blocks: u64) {}
    fn delete(&self, _path: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, sources: &[std::path::PathBuf], dest: &str) {
        let srcs: Vec<String> = sources.iter().map(|s| s.display().to_string()).collect();
        self.line(&format!("START src={} dst={}", srcs.join(","), dest));
    }
    fn sent(&self, path: &str, bytes: u64) {
        self.line(&format!("SEND path={path} bytes={bytes}"));
    }
    fn delta(&self, path: &str, literal_bytes: u64, copied_blocks: u64) {
        self.line(&format!(
            "DELTA path={path} literal={literal_bytes} copied_blocks={copied_blocks}"
        ));
    }
    fn delete(&self, path: &str) {
        self.line(&format!("DELETE path={path}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let logger = TextLogger::new(&path).unwrap();
        logger.sent("a.txt", 10);
        logger.delete("gone.txt");
        logger.done(1, 10, 0.5);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.contains("SEND path=a.txt bytes=10"));
        assert!(text.contains("DELETE path=gone.txt"));
    }
}
