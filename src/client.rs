//! Client-side phase machine driving one sync run end-to-end.
//!
//! Phases are strictly ordered; any error aborts the session and surfaces to
//! the caller with its kind. The one concession to partial failure is the
//! worker-reported `failed` count in the final summary.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::time::Instant;

use crate::checksum::ChecksumType;
use crate::classify::Classification;
use crate::delta::{compute_delta, decode_signatures, encode_delta, DeltaInstruction};
use crate::error::{Result, SyncError};
use crate::filter::PathFilter;
use crate::inventory::{encode_file_chunk, scan, ScanResult};
use crate::logger::Logger;
use crate::options::SyncOptions;
use crate::progress::ProgressSink;
use crate::protocol::{major_of, proto_version, put_u32, tag, PayloadReader, FILE_CHUNK};
use crate::session::{Session, Summary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Connected,
    HandshakeDone,
    OptionsSent,
    InventorySent,
    Classified,
    WholeFilesSent,
    DeltasSent,
    Done,
}

pub struct SyncClient<'a> {
    session: Session,
    opts: SyncOptions,
    sources: Vec<PathBuf>,
    filter: &'a dyn PathFilter,
    logger: &'a dyn Logger,
    progress: &'a dyn ProgressSink,
    phase: Phase,
}

impl<'a> SyncClient<'a> {
    /// The session must already hold a connected socket.
    pub fn new(
        session: Session,
        sources: Vec<PathBuf>,
        opts: SyncOptions,
        filter: &'a dyn PathFilter,
        logger: &'a dyn Logger,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            session,
            opts,
            sources,
            filter,
            logger,
            progress,
            phase: Phase::Connected,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> crate::session::TransferStats {
        self.session.stats
    }

    pub fn run(&mut self) -> Result<Summary> {
        let started = Instant::now();
        let result = self.drive();
        match &result {
            Ok(summary) => {
                self.logger.done(
                    (summary.ok + summary.failed) as u64,
                    self.session.stats.raw_bytes,
                    started.elapsed().as_secs_f64(),
                );
            }
            Err(e) => {
                self.logger.error("session", &e.to_string());
                self.session.shutdown();
            }
        }
        result
    }

    fn drive(&mut self) -> Result<Summary> {
        self.handshake()?;
        self.session.cancel.check()?;
        self.send_options()?;
        let scanned = self.send_inventory()?;
        self.session.cancel.check()?;
        let class = self.receive_classification(&scanned)?;

        for path in &class.deleted {
            self.progress.deleted(path);
            self.logger.delete(path);
        }
        self.session.stats.files_deleted = class.deleted.len() as u64;

        if self.opts.dry_run {
            // Nothing moves; fabricate the accounting from the verdicts
            let summary = Summary {
                bytes_in: 0,
                bytes_out: 0,
                ok: (class.missing.len() + class.changed.len()) as u32,
                failed: 0,
            };
            self.session.pump.send(tag::SHUTDOWN, &[])?;
            self.phase = Phase::Done;
            return Ok(summary);
        }

        self.send_whole_files(&scanned, &class)?;
        self.send_deltas(&scanned, &class)?;

        let summary = self.receive_summary()?;
        self.session.pump.send(tag::SHUTDOWN, &[])?;
        self.phase = Phase::Done;
        Ok(summary)
    }

    /// Receive one frame, surfacing a peer-reported error as `Remote`.
    fn recv_expect(&mut self, want: u16) -> Result<Vec<u8>> {
        let (got, payload) = self.session.pump.recv()?;
        if got == tag::ERROR {
            let mut r = PayloadReader::new(&payload);
            let kind = r.u16()?;
            let msg = String::from_utf8_lossy(r.rest()).into_owned();
            // A peer-reported framing violation is a protocol failure on
            // both ends; everything else surfaces as a remote error
            return Err(if kind == SyncError::Protocol(String::new()).wire_code() {
                SyncError::Protocol(msg)
            } else {
                SyncError::Remote(format!("{}: {msg}", SyncError::wire_code_name(kind)))
            });
        }
        if got != want {
            return Err(SyncError::Protocol(format!(
                "expected frame tag {want}, got {got}"
            )));
        }
        Ok(payload)
    }

    fn handshake(&mut self) -> Result<()> {
        let mut hello = Vec::with_capacity(4);
        put_u32(&mut hello, proto_version());
        self.session.pump.send(tag::HELLO, &hello)?;

        let payload = self.recv_expect(tag::HELLO_ACK)?;
        let mut r = PayloadReader::new(&payload);
        let theirs = r.u32()?;
        if major_of(theirs) != major_of(proto_version()) {
            return Err(SyncError::Protocol(format!(
                "protocol major mismatch: ours {:#x}, theirs {theirs:#x}",
                proto_version()
            )));
        }
        self.phase = Phase::HandshakeDone;
        Ok(())
    }

    fn send_options(&mut self) -> Result<()> {
        self.opts.validate()?;
        self.session.pump.send(tag::OPTIONS, &self.opts.encode())?;
        self.phase = Phase::OptionsSent;
        Ok(())
    }

    fn send_inventory(&mut self) -> Result<ScanResult> {
        self.progress.phase("scanning sources");
        let scanned = scan(
            &self.sources,
            self.opts.recursive,
            self.opts.relative,
            self.filter,
        )?;
        self.session.stats.files_examined = scanned.inventory.files.len() as u64;
        self.session
            .pump
            .send(tag::INVENTORY, &scanned.inventory.encode())?;
        self.phase = Phase::InventorySent;
        Ok(scanned)
    }

    fn receive_classification(&mut self, scanned: &ScanResult) -> Result<Classification> {
        let payload = self.recv_expect(tag::CLASSIFICATION)?;
        let class = Classification::decode(&payload)?;
        let file_count = scanned.inventory.files.len() as u32;
        for list in [&class.missing, &class.changed, &class.identical] {
            if let Some(&bad) = list.iter().find(|&&i| i >= file_count) {
                return Err(SyncError::Protocol(format!(
                    "classification index {bad} out of range ({file_count} files)"
                )));
            }
        }
        self.phase = Phase::Classified;
        Ok(class)
    }

    fn send_whole_files(&mut self, scanned: &ScanResult, class: &Classification) -> Result<()> {
        self.progress.phase("sending missing files");
        for &idx in &class.missing {
            self.session.cancel.check()?;
            let rec = &scanned.inventory.files[idx as usize];
            let local = &scanned.local_paths[idx as usize];

            let mut file = File::open(local).map_err(SyncError::LocalIo)?;
            self.session.pump.begin_compress(self.opts.compress_level)?;
            let mut remaining = rec.size;
            let mut buf = vec![0u8; (FILE_CHUNK as u64).min(rec.size.max(1)) as usize];
            loop {
                let want = remaining.min(buf.len() as u64) as usize;
                // A shrunk file would starve the receiver; fail the run instead
                file.read_exact(&mut buf[..want]).map_err(SyncError::LocalIo)?;
                self.session
                    .pump
                    .send(tag::FILE_WHOLE, &encode_file_chunk(idx, rec, &buf[..want]))?;
                remaining -= want as u64;
                if remaining == 0 {
                    break;
                }
            }
            self.session.pump.end_compress()?;

            self.session.stats.files_sent += 1;
            self.session.stats.raw_bytes += rec.size;
            self.progress.file("send", &rec.rel_path, rec.size);
            self.logger.sent(&rec.rel_path, rec.size);
        }
        self.phase = Phase::WholeFilesSent;
        Ok(())
    }

    fn send_deltas(&mut self, scanned: &ScanResult, class: &Classification) -> Result<()> {
        self.progress.phase("updating changed files");
        for &idx in &class.changed {
            self.session.cancel.check()?;
            let rec = &scanned.inventory.files[idx as usize];
            let local = &scanned.local_paths[idx as usize];

            let payload = self.recv_expect(tag::SIGNATURES)?;
            let (sig_idx, block_size, sigs) = decode_signatures(&payload)?;
            if sig_idx != idx {
                return Err(SyncError::Protocol(format!(
                    "signatures for file {sig_idx}, expected {idx}"
                )));
            }
            if block_size == 0 {
                return Err(SyncError::Protocol("zero block size in signatures".into()));
            }

            let source = std::fs::read(local).map_err(SyncError::LocalIo)?;
            if source.len() as u64 != rec.size {
                // The worker expects exactly the inventoried byte count; a
                // file edited mid-run cannot be patched coherently
                return Err(SyncError::LocalIo(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{} changed size during the run", rec.rel_path),
                )));
            }
            let digest_type = sigs
                .first()
                .and_then(|s| ChecksumType::from_digest_len(s.strong.len()))
                .unwrap_or_default();
            let instrs = compute_delta(&source, &sigs, block_size, digest_type);

            let mut literal_bytes = 0u64;
            let mut copied_blocks = 0u64;
            for instr in &instrs {
                match instr {
                    DeltaInstruction::Literal { bytes } => literal_bytes += bytes.len() as u64,
                    DeltaInstruction::CopyBlock { count, .. } => copied_blocks += *count as u64,
                }
            }

            self.session.pump.begin_compress(self.opts.compress_level)?;
            self.send_instruction_frames(idx, instrs)?;
            self.session.pump.end_compress()?;

            self.session.stats.files_delta += 1;
            self.session.stats.raw_bytes += literal_bytes;
            self.progress.file("delta", &rec.rel_path, literal_bytes);
            self.logger.delta(&rec.rel_path, literal_bytes, copied_blocks);
        }
        self.phase = Phase::DeltasSent;
        Ok(())
    }

    /// Pack instructions into frames of roughly `FILE_CHUNK` encoded bytes.
    /// At least one frame goes out even for an empty instruction list.
    fn send_instruction_frames(&mut self, idx: u32, instrs: Vec<DeltaInstruction>) -> Result<()> {
        fn encoded_size(instr: &DeltaInstruction) -> usize {
            match instr {
                DeltaInstruction::CopyBlock { .. } => 9,
                DeltaInstruction::Literal { bytes } => 5 + bytes.len(),
            }
        }

        let mut iter = instrs.into_iter().peekable();
        let mut sent_any = false;
        while iter.peek().is_some() || !sent_any {
            let mut batch = Vec::new();
            let mut batch_bytes = 8usize;
            while let Some(next) = iter.peek() {
                let size = encoded_size(next);
                if !batch.is_empty() && batch_bytes + size > FILE_CHUNK {
                    break;
                }
                batch_bytes += size;
                batch.push(iter.next().unwrap());
            }
            self.session.pump.send(tag::DELTA, &encode_delta(idx, &batch))?;
            sent_any = true;
        }
        Ok(())
    }

    fn receive_summary(&mut self) -> Result<Summary> {
        let payload = self.recv_expect(tag::SUMMARY)?;
        Summary::decode(&payload)
    }
}
