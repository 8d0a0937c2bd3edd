//! Source enumeration into the wire inventory.
//!
//! Two runs over an unchanged tree must produce byte-identical payloads, so
//! the walk is depth-first in file-name order and symlink cycles are broken
//! by a visited-inode set.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::filter::PathFilter;
use crate::protocol::{put_i64, put_str, put_u16, put_u32, put_u64, PayloadReader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub rel_path: String,
    pub size: u64,
    pub mtime: i64,
    pub perms: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub rel_path: String,
    pub perms: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub files: Vec<FileRecord>,
    pub dirs: Vec<DirRecord>,
}

/// Inventory plus the absolute local path behind each file record.
/// Only the inventory goes on the wire.
pub struct ScanResult {
    pub inventory: Inventory,
    pub local_paths: Vec<PathBuf>,
}

/// True for the path shape the wire accepts: forward slashes, no leading
/// slash, no empty, `.` or `..` components, no NUL.
pub fn is_clean_rel(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\0')
        && path
            .split('/')
            .all(|c| !c.is_empty() && c != "." && c != "..")
}

fn rel_string(p: &Path) -> String {
    p.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn mtime_of(md: &std::fs::Metadata) -> i64 {
    filetime::FileTime::from_last_modification_time(md).unix_seconds()
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

#[cfg(unix)]
fn dir_key(md: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (md.dev(), md.ino())
}

#[cfg(not(unix))]
fn dir_key(md: &std::fs::Metadata) -> (u64, u64) {
    (0, md.len())
}

/// Walk `sources` into an inventory. `relative` keeps the source path as
/// given as a destination prefix; otherwise paths are relative to each
/// source root.
pub fn scan(
    sources: &[PathBuf],
    recursive: bool,
    relative: bool,
    filter: &dyn PathFilter,
) -> Result<ScanResult> {
    let mut files: Vec<FileRecord> = Vec::new();
    let mut local_paths: Vec<PathBuf> = Vec::new();
    let mut dirs: Vec<DirRecord> = Vec::new();
    let mut seen_files: HashSet<String> = HashSet::new();
    let mut seen_dirs: HashSet<String> = HashSet::new();
    let mut visited_dirs: HashSet<(u64, u64)> = HashSet::new();

    for source in sources {
        let md = std::fs::metadata(source).map_err(SyncError::LocalIo)?;
        let prefix = if relative { rel_string(source) } else { String::new() };

        if md.is_file() {
            let rel = if relative {
                prefix.clone()
            } else {
                rel_string(Path::new(
                    source.file_name().ok_or_else(|| {
                        SyncError::Usage(format!("source {} has no file name", source.display()))
                    })?,
                ))
            };
            if filter.includes(&rel) && seen_files.insert(rel.clone()) {
                files.push(FileRecord {
                    rel_path: rel,
                    size: md.len(),
                    mtime: mtime_of(&md),
                    perms: perms_of(&md),
                });
                local_paths.push(source.clone());
            }
            continue;
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut walker = WalkDir::new(source)
            .follow_links(true)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(e) => e,
                // Unreadable entries and walkdir's own loop detection are
                // skipped rather than aborting the whole run
                Err(_) => continue,
            };
            let rel_raw = entry.path().strip_prefix(source).unwrap_or(entry.path());
            if rel_raw.as_os_str().is_empty() {
                continue;
            }
            let rel_str = rel_string(rel_raw);
            let rel = if prefix.is_empty() {
                rel_str
            } else {
                format!("{prefix}/{rel_str}")
            };

            if entry.file_type().is_dir() {
                if !filter.includes(&rel) {
                    walker.skip_current_dir();
                    continue;
                }
                let dmd = match entry.metadata() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if !visited_dirs.insert(dir_key(&dmd)) {
                    walker.skip_current_dir();
                    continue;
                }
                if recursive && seen_dirs.insert(rel.clone()) {
                    dirs.push(DirRecord {
                        rel_path: rel,
                        perms: perms_of(&dmd),
                    });
                }
            } else {
                let fmd = match entry.metadata() {
                    Ok(m) if m.is_file() => m,
                    // Sockets, fifos, dangling symlinks
                    _ => continue,
                };
                if filter.includes(&rel) && seen_files.insert(rel.clone()) {
                    files.push(FileRecord {
                        rel_path: rel,
                        size: fmd.len(),
                        mtime: mtime_of(&fmd),
                        perms: perms_of(&fmd),
                    });
                    local_paths.push(entry.path().to_path_buf());
                }
            }
        }
    }

    // Every ancestor of an included file must appear as a dir record
    for file in &files {
        let mut parent = file.rel_path.as_str();
        while let Some(cut) = parent.rfind('/') {
            parent = &parent[..cut];
            if seen_dirs.insert(parent.to_string()) {
                dirs.push(DirRecord {
                    rel_path: parent.to_string(),
                    perms: 0o755,
                });
            }
        }
    }
    dirs.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    // Wire strings carry a u16 length prefix
    if let Some(bad) = files
        .iter()
        .map(|f| &f.rel_path)
        .chain(dirs.iter().map(|d| &d.rel_path))
        .find(|p| p.len() > u16::MAX as usize)
    {
        return Err(SyncError::Usage(format!(
            "relative path of {} bytes is too long to transfer",
            bad.len()
        )));
    }

    Ok(ScanResult {
        inventory: Inventory { files, dirs },
        local_paths,
    })
}

impl Inventory {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, self.files.len() as u32);
        for f in &self.files {
            put_str(&mut buf, &f.rel_path);
            put_u64(&mut buf, f.size);
            put_i64(&mut buf, f.mtime);
            put_u16(&mut buf, f.perms);
        }
        put_u32(&mut buf, self.dirs.len() as u32);
        for d in &self.dirs {
            put_str(&mut buf, &d.rel_path);
            put_u16(&mut buf, d.perms);
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Inventory> {
        let mut r = PayloadReader::new(payload);
        let file_count = r.u32()? as usize;
        let mut files = Vec::with_capacity(file_count.min(1 << 20));
        for _ in 0..file_count {
            let rel_path = r.str()?;
            if !is_clean_rel(&rel_path) {
                return Err(SyncError::Protocol(format!("unsafe path {rel_path:?}")));
            }
            files.push(FileRecord {
                rel_path,
                size: r.u64()?,
                mtime: r.i64()?,
                perms: r.u16()?,
            });
        }
        let dir_count = r.u32()? as usize;
        let mut dirs = Vec::with_capacity(dir_count.min(1 << 20));
        for _ in 0..dir_count {
            let rel_path = r.str()?;
            if !is_clean_rel(&rel_path) {
                return Err(SyncError::Protocol(format!("unsafe path {rel_path:?}")));
            }
            dirs.push(DirRecord {
                rel_path,
                perms: r.u16()?,
            });
        }
        r.expect_end()?;
        Ok(Inventory { files, dirs })
    }
}

/// Payload of one whole-file frame. Large files span several frames with
/// identical header fields; the receiver appends until `size` is reached.
pub fn encode_file_chunk(idx: u32, rec: &FileRecord, bytes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22 + bytes.len());
    put_u32(&mut buf, idx);
    put_u64(&mut buf, rec.size);
    put_i64(&mut buf, rec.mtime);
    put_u16(&mut buf, rec.perms);
    buf.extend_from_slice(bytes);
    buf
}

pub struct FileChunk<'a> {
    pub idx: u32,
    pub size: u64,
    pub mtime: i64,
    pub perms: u16,
    pub bytes: &'a [u8],
}

pub fn decode_file_chunk(payload: &[u8]) -> Result<FileChunk<'_>> {
    let mut r = PayloadReader::new(payload);
    let idx = r.u32()?;
    let size = r.u64()?;
    let mtime = r.i64()?;
    let perms = r.u16()?;
    let bytes = r.rest();
    Ok(FileChunk {
        idx,
        size,
        mtime,
        perms,
        bytes,
    })
}
