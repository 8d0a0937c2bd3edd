//! Per-run options, validated on both sides and carried in one frame.

use crate::error::{Result, SyncError};
use crate::protocol::{put_u32, PayloadReader};

pub const DEFAULT_COMPRESS_LEVEL: u8 = 6;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 10;

const FLAG_RECURSIVE: u32 = 1 << 0;
const FLAG_DELETE: u32 = 1 << 1;
const FLAG_WHOLE_FILE: u32 = 1 << 2;
const FLAG_CHECKSUM: u32 = 1 << 3;
const FLAG_DRY_RUN: u32 = 1 << 4;
const FLAG_EXISTING: u32 = 1 << 5;
const FLAG_RELATIVE: u32 = 1 << 6;
const FLAG_QUIET: u32 = 1 << 7;
const FLAG_JSON: u32 = 1 << 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    /// Walk subdirectories of each source.
    pub recursive: bool,
    /// Remove remote files absent locally; requires `recursive`.
    pub delete_extras: bool,
    /// Skip the signature phase; changed files are re-sent whole.
    pub whole_file: bool,
    /// Compare file content by strong digest during classification.
    pub checksum: bool,
    /// Classify only; no remote writes or deletes.
    pub dry_run: bool,
    /// Skip files that do not already exist remotely.
    pub existing: bool,
    /// Preserve source path prefixes in destination paths.
    pub relative: bool,
    /// Zstandard level for the bulk phases, 1-22.
    pub compress_level: u8,
    pub connection_timeout_secs: u32,
    /// 0-3; per-file reporting starts at 1.
    pub verbosity: u8,
    pub quiet: bool,
    /// Structured progress, one JSON object per line.
    pub json: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            delete_extras: false,
            whole_file: false,
            checksum: false,
            dry_run: false,
            existing: false,
            relative: false,
            compress_level: DEFAULT_COMPRESS_LEVEL,
            connection_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            verbosity: 0,
            quiet: false,
            json: false,
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<()> {
        if self.delete_extras && !self.recursive {
            return Err(SyncError::Usage(
                "--delete requires --recursive".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compress_level) {
            return Err(SyncError::Usage(format!(
                "compression level {} out of range 1-22",
                self.compress_level
            )));
        }
        if self.verbosity > 3 {
            return Err(SyncError::Usage(format!(
                "verbosity {} out of range 0-3",
                self.verbosity
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u32;
        for (on, bit) in [
            (self.recursive, FLAG_RECURSIVE),
            (self.delete_extras, FLAG_DELETE),
            (self.whole_file, FLAG_WHOLE_FILE),
            (self.checksum, FLAG_CHECKSUM),
            (self.dry_run, FLAG_DRY_RUN),
            (self.existing, FLAG_EXISTING),
            (self.relative, FLAG_RELATIVE),
            (self.quiet, FLAG_QUIET),
            (self.json, FLAG_JSON),
        ] {
            if on {
                flags |= bit;
            }
        }
        let mut buf = Vec::with_capacity(10);
        put_u32(&mut buf, flags);
        buf.push(self.compress_level);
        put_u32(&mut buf, self.connection_timeout_secs);
        buf.push(self.verbosity);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<SyncOptions> {
        let mut r = PayloadReader::new(payload);
        let flags = r.u32()?;
        let compress_level = r.u8()?;
        let connection_timeout_secs = r.u32()?;
        let verbosity = r.u8()?;
        r.expect_end()?;
        Ok(SyncOptions {
            recursive: flags & FLAG_RECURSIVE != 0,
            delete_extras: flags & FLAG_DELETE != 0,
            whole_file: flags & FLAG_WHOLE_FILE != 0,
            checksum: flags & FLAG_CHECKSUM != 0,
            dry_run: flags & FLAG_DRY_RUN != 0,
            existing: flags & FLAG_EXISTING != 0,
            relative: flags & FLAG_RELATIVE != 0,
            compress_level,
            connection_timeout_secs,
            verbosity,
            quiet: flags & FLAG_QUIET != 0,
            json: flags & FLAG_JSON != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let opts = SyncOptions {
            recursive: true,
            delete_extras: true,
            checksum: true,
            compress_level: 19,
            connection_timeout_secs: 30,
            verbosity: 2,
            json: true,
            ..Default::default()
        };
        assert_eq!(SyncOptions::decode(&opts.encode()).unwrap(), opts);
    }

    #[test]
    fn delete_requires_recursive() {
        let opts = SyncOptions {
            delete_extras: true,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(SyncError::Usage(_))));

        let opts = SyncOptions {
            recursive: true,
            delete_extras: true,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn compress_level_bounds() {
        for (level, ok) in [(0u8, false), (1, true), (22, true), (23, false)] {
            let opts = SyncOptions {
                compress_level: level,
                ..Default::default()
            };
            assert_eq!(opts.validate().is_ok(), ok, "level {level}");
        }
    }
}
