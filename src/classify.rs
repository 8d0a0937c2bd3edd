//! Server-side diff of the client inventory against the destination tree.

use std::collections::HashSet;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::inventory::Inventory;
use crate::options::SyncOptions;
use crate::protocol::{put_str, put_u32, PayloadReader};

/// Timestamp tolerance masking filesystem granularity.
const MTIME_TOLERANCE_SECS: i64 = 1;

/// Per-file verdicts, indices into the client's inventory order, plus the
/// remote-only paths eligible for deletion (dirs after files, deepest first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub missing: Vec<u32>,
    pub changed: Vec<u32>,
    pub identical: Vec<u32>,
    pub deleted: Vec<String>,
}

pub fn classify(inv: &Inventory, root: &Path, opts: &SyncOptions) -> Result<Classification> {
    let mut out = Classification::default();

    for (i, rec) in inv.files.iter().enumerate() {
        let i = i as u32;
        let dest = root.join(&rec.rel_path);
        let md = match std::fs::metadata(&dest) {
            Ok(md) if md.is_file() => Some(md),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::LocalIo(e)),
        };

        let Some(md) = md else {
            if !opts.existing {
                out.missing.push(i);
            }
            continue;
        };

        let mtime = filetime::FileTime::from_last_modification_time(&md).unix_seconds();
        let meta_match = md.len() == rec.size
            && (mtime - rec.mtime).abs() <= MTIME_TOLERANCE_SECS
            && perms_of(&md) & 0o777 == rec.perms & 0o777;

        // Content-hash mode distrusts metadata entirely: matching files go
        // through the signature phase, where equal content costs no literals.
        if meta_match && !opts.checksum {
            out.identical.push(i);
        } else if opts.whole_file {
            out.missing.push(i);
        } else {
            out.changed.push(i);
        }
    }

    if opts.recursive && opts.delete_extras && root.is_dir() {
        let keep_files: HashSet<&str> = inv.files.iter().map(|f| f.rel_path.as_str()).collect();
        let keep_dirs: HashSet<&str> = inv.dirs.iter().map(|d| d.rel_path.as_str()).collect();
        let mut extra_dirs = Vec::new();

        for entry in WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if rel.as_os_str().is_empty() {
                continue;
            }
            let rel = rel.to_string_lossy().replace('\\', "/");
            if entry.file_type().is_dir() {
                if !keep_dirs.contains(rel.as_str()) {
                    extra_dirs.push(rel);
                }
            } else if !keep_files.contains(rel.as_str()) {
                out.deleted.push(rel);
            }
        }
        // Children before parents so directory removal finds them empty
        extra_dirs.sort_by(|a, b| b.cmp(a));
        out.deleted.extend(extra_dirs);
    }

    Ok(out)
}

#[cfg(unix)]
fn perms_of(md: &std::fs::Metadata) -> u16 {
    use std::os::unix::fs::PermissionsExt;
    (md.permissions().mode() & 0o7777) as u16
}

#[cfg(not(unix))]
fn perms_of(md: &std::fs::Metadata) -> u16 {
    if md.permissions().readonly() {
        0o555
    } else {
        0o755
    }
}

impl Classification {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for list in [&self.missing, &self.changed, &self.identical] {
            put_u32(&mut buf, list.len() as u32);
            for &idx in list {
                put_u32(&mut buf, idx);
            }
        }
        put_u32(&mut buf, self.deleted.len() as u32);
        for path in &self.deleted {
            put_str(&mut buf, path);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Classification> {
        let mut r = PayloadReader::new(payload);
        let mut lists: [Vec<u32>; 3] = Default::default();
        for list in &mut lists {
            let count = r.u32()? as usize;
            list.reserve(count.min(1 << 20));
            for _ in 0..count {
                list.push(r.u32()?);
            }
        }
        let [missing, changed, identical] = lists;
        let count = r.u32()? as usize;
        let mut deleted = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            deleted.push(r.str()?);
        }
        r.expect_end()?;
        Ok(Classification {
            missing,
            changed,
            identical,
            deleted,
        })
    }
}
