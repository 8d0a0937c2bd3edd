//! Worker-side session: accepts exactly one client, mirrors its tree, exits.
//!
//! All writes go through a sibling temp file renamed over the target on
//! success; a failed reconstruction leaves the old content untouched and
//! counts into the summary's `failed` field. Deletion runs only after every
//! write succeeded.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use std::path::{Component, Path, PathBuf};

use crate::checksum::{block_size_for, ChecksumType};
use crate::classify::{classify, Classification};
use crate::delta::{compute_signatures, decode_delta, encode_signatures, DeltaApplier, DeltaInstruction};
use crate::error::{Result, SyncError};
use crate::inventory::{decode_file_chunk, FileRecord, Inventory};
use crate::options::SyncOptions;
use crate::protocol::{major_of, proto_version, put_u16, put_u32, tag, PayloadReader};
use crate::pump::MessagePump;
use crate::session::Summary;

/// Serve one client connection against `root`.
pub fn run_connection(stream: TcpStream, root: &Path) -> Result<()> {
    stream.set_nodelay(true).ok();
    let mut pump = MessagePump::new(stream);
    match serve_session(&mut pump, root) {
        Ok(()) => Ok(()),
        Err(e) => {
            let mut payload = Vec::new();
            put_u16(&mut payload, e.wire_code());
            payload.extend_from_slice(e.to_string().as_bytes());
            let _ = pump.send(tag::ERROR, &payload);
            Err(e)
        }
    }
}

fn expect(pump: &mut MessagePump<TcpStream>, want: u16) -> Result<Vec<u8>> {
    let (got, payload) = pump.recv()?;
    if got != want {
        return Err(SyncError::Protocol(format!(
            "expected frame tag {want}, got {got}"
        )));
    }
    Ok(payload)
}

fn serve_session(pump: &mut MessagePump<TcpStream>, root: &Path) -> Result<()> {
    let payload = expect(pump, tag::HELLO)?;
    let theirs = PayloadReader::new(&payload).u32()?;
    if major_of(theirs) != major_of(proto_version()) {
        return Err(SyncError::Protocol(format!(
            "protocol major mismatch: ours {:#x}, client {theirs:#x}",
            proto_version()
        )));
    }
    let mut ack = Vec::with_capacity(4);
    put_u32(&mut ack, proto_version());
    pump.send(tag::HELLO_ACK, &ack)?;

    let payload = expect(pump, tag::OPTIONS)?;
    let opts = SyncOptions::decode(&payload)?;
    opts.validate()?;

    let payload = expect(pump, tag::INVENTORY)?;
    let inv = Inventory::decode(&payload)?;
    eprintln!(
        "remitd: inventory of {} files, {} dirs",
        inv.files.len(),
        inv.dirs.len()
    );

    fs::create_dir_all(root).map_err(SyncError::LocalIo)?;
    let class = classify(&inv, root, &opts)?;
    if !opts.dry_run {
        create_dirs(root, &inv)?;
    }
    pump.send(tag::CLASSIFICATION, &class.encode())?;

    if opts.dry_run {
        expect(pump, tag::SHUTDOWN)?;
        return Ok(());
    }

    let mut ok = 0u32;
    let mut failed = 0u32;

    for &idx in &class.missing {
        let rec = &inv.files[idx as usize];
        if receive_whole_file(pump, root, idx, rec)? {
            ok += 1;
        } else {
            failed += 1;
        }
    }

    for &idx in &class.changed {
        let rec = &inv.files[idx as usize];
        if update_changed_file(pump, root, idx, rec)? {
            ok += 1;
        } else {
            failed += 1;
        }
    }

    // A failed write means the client run was not faithful; keep remote
    // data until a clean pass
    if opts.recursive && opts.delete_extras && failed == 0 {
        delete_extras(root, &class);
    }

    let summary = Summary {
        bytes_in: pump.bytes_received(),
        bytes_out: pump.bytes_sent(),
        ok,
        failed,
    };
    pump.send(tag::SUMMARY, &summary.encode())?;

    expect(pump, tag::SHUTDOWN)?;
    eprintln!("remitd: session done, {ok} ok, {failed} failed");
    Ok(())
}

/// Join a wire-validated relative path under the root, refusing anything
/// that is not a plain chain of normal components.
fn safe_dest_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(c) => out.push(c),
            other => {
                return Err(SyncError::Protocol(format!(
                    "path {rel:?} contains disallowed component {other:?}"
                )))
            }
        }
    }
    Ok(out)
}

fn create_dirs(root: &Path, inv: &Inventory) -> Result<()> {
    for dir in &inv.dirs {
        let path = safe_dest_path(root, &dir.rel_path)?;
        if !path.is_dir() {
            fs::create_dir_all(&path).map_err(SyncError::LocalIo)?;
            let mode = if dir.perms == 0 { 0o755 } else { dir.perms };
            set_mode(&path, mode);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u16) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode as u32));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u16) {}

/// Sibling temp file that disappears unless committed.
struct TempSink {
    file: Option<BufWriter<File>>,
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

impl TempSink {
    fn create(dest: &Path) -> std::io::Result<Self> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let tmp = parent.join(format!(".{name}.tmp"));
        let file = File::create(&tmp)?;
        Ok(Self {
            file: Some(BufWriter::new(file)),
            tmp,
            dest: dest.to_path_buf(),
            committed: false,
        })
    }

    fn writer(&mut self) -> &mut BufWriter<File> {
        self.file.as_mut().expect("writer used after commit")
    }

    /// Flush, apply metadata, and atomically rename over the target.
    fn commit(&mut self, perms: u16, mtime: i64) -> std::io::Result<()> {
        let mut writer = self.file.take().expect("double commit");
        writer.flush()?;
        drop(writer);
        set_mode(&self.tmp, if perms == 0 { 0o644 } else { perms });
        filetime::set_file_mtime(&self.tmp, filetime::FileTime::from_unix_time(mtime, 0))?;
        fs::rename(&self.tmp, &self.dest)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TempSink {
    fn drop(&mut self) {
        if !self.committed {
            self.file.take();
            let _ = fs::remove_file(&self.tmp);
        }
    }
}

/// Returns Ok(true) when the file landed, Ok(false) on a local failure that
/// left the target untouched. The incoming frames are consumed either way so
/// the stream stays in step.
fn receive_whole_file(
    pump: &mut MessagePump<TcpStream>,
    root: &Path,
    idx: u32,
    rec: &FileRecord,
) -> Result<bool> {
    let dest = safe_dest_path(root, &rec.rel_path)?;
    let mut sink = match TempSink::create(&dest) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("remitd: cannot stage {}: {e}", rec.rel_path);
            None
        }
    };

    let mut received = 0u64;
    loop {
        let payload = expect(pump, tag::FILE_WHOLE)?;
        let chunk = decode_file_chunk(&payload)?;
        if chunk.idx != idx {
            return Err(SyncError::Protocol(format!(
                "file data for index {}, expected {idx}",
                chunk.idx
            )));
        }
        received += chunk.bytes.len() as u64;
        if received > rec.size {
            return Err(SyncError::Protocol(format!(
                "{} bytes for {} which announced {}",
                received, rec.rel_path, rec.size
            )));
        }
        if chunk.bytes.is_empty() && rec.size > 0 {
            return Err(SyncError::Protocol("empty file data frame".into()));
        }
        if let Some(s) = &mut sink {
            if let Err(e) = s.writer().write_all(chunk.bytes) {
                eprintln!("remitd: write failed for {}: {e}", rec.rel_path);
                sink = None;
            }
        }
        if received >= rec.size {
            break;
        }
    }

    match sink {
        Some(mut s) => match s.commit(rec.perms, rec.mtime) {
            Ok(()) => Ok(true),
            Err(e) => {
                eprintln!("remitd: commit failed for {}: {e}", rec.rel_path);
                Ok(false)
            }
        },
        None => Ok(false),
    }
}

/// Sign the existing file, then apply the client's instruction stream.
fn update_changed_file(
    pump: &mut MessagePump<TcpStream>,
    root: &Path,
    idx: u32,
    rec: &FileRecord,
) -> Result<bool> {
    let dest = safe_dest_path(root, &rec.rel_path)?;

    let (block_size, sigs) = match File::open(&dest) {
        Ok(file) => {
            let len = file.metadata().map_err(SyncError::LocalIo)?.len();
            let block_size = block_size_for(len);
            let sigs =
                compute_signatures(BufReader::new(file), block_size, ChecksumType::default())
                    .map_err(SyncError::LocalIo)?;
            (block_size, sigs)
        }
        // Classified as changed but gone by now; an empty signature set
        // makes the client send everything as literals
        Err(_) => (block_size_for(rec.size), Vec::new()),
    };
    pump.send(tag::SIGNATURES, &encode_signatures(idx, block_size, &sigs))?;

    let basis = File::open(&dest).ok();
    let mut sink = match TempSink::create(&dest) {
        Ok(s) => Some(s),
        Err(e) => {
            eprintln!("remitd: cannot stage {}: {e}", rec.rel_path);
            None
        }
    };
    let mut applier = basis.map(|f| DeltaApplier::new(f, block_size));
    let mut local_fail = sink.is_none();
    let mut virtual_written = 0u64;

    loop {
        let payload = expect(pump, tag::DELTA)?;
        let (delta_idx, instrs) = decode_delta(&payload)?;
        if delta_idx != idx {
            return Err(SyncError::Protocol(format!(
                "delta for index {delta_idx}, expected {idx}"
            )));
        }

        for instr in &instrs {
            virtual_written += match instr {
                DeltaInstruction::CopyBlock { count, .. } => *count as u64 * block_size as u64,
                DeltaInstruction::Literal { bytes } => bytes.len() as u64,
            };
            if local_fail {
                continue;
            }
            let outcome = match (&mut applier, &mut sink) {
                (Some(applier), Some(sink)) => applier.apply(instr, sink.writer()),
                // Basis vanished between signing and applying
                _ => Err(SyncError::LocalIo(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "old file disappeared",
                ))),
            };
            match outcome {
                Ok(()) => {}
                Err(SyncError::LocalIo(e)) => {
                    eprintln!("remitd: apply failed for {}: {e}", rec.rel_path);
                    local_fail = true;
                    sink = None;
                }
                Err(SyncError::Protocol(msg)) => {
                    // Out-of-range copy: the reconstruction is unusable but
                    // the stream itself is still well-formed
                    eprintln!("remitd: bad delta for {}: {msg}", rec.rel_path);
                    local_fail = true;
                    sink = None;
                }
                Err(other) => return Err(other),
            }
        }

        if virtual_written > rec.size {
            return Err(SyncError::Protocol(format!(
                "delta reconstructs {} bytes for {} which announced {}",
                virtual_written, rec.rel_path, rec.size
            )));
        }
        if virtual_written == rec.size {
            break;
        }
    }

    if local_fail {
        return Ok(false);
    }
    match sink {
        Some(mut s) => match s.commit(rec.perms, rec.mtime) {
            Ok(()) => Ok(true),
            Err(e) => {
                eprintln!("remitd: commit failed for {}: {e}", rec.rel_path);
                Ok(false)
            }
        },
        None => Ok(false),
    }
}

fn delete_extras(root: &Path, class: &Classification) {
    for rel in &class.deleted {
        let Ok(path) = safe_dest_path(root, rel) else {
            continue;
        };
        let result = if path.is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            eprintln!("remitd: delete failed for {rel}: {e}");
        }
    }
}
