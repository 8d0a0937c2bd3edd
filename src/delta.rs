//! Block signatures, delta generation, and reconstruction.
//!
//! The server signs its existing copy of a changed file; the client walks its
//! local copy with a rolling checksum and emits copy/literal instructions that
//! the server replays against the old content.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::checksum::{strong_checksum, weak_checksum, ChecksumType, RollingChecksum};
use crate::error::{Result, SyncError};
use crate::protocol::{put_u32, PayloadReader};

/// Literal instructions are chunked to this size to bound memory.
pub const MAX_LITERAL: usize = 64 * 1024;

/// Signature of one block of the remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    pub weak: u32,
    pub strong: Vec<u8>,
}

/// One step of a delta stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaInstruction {
    /// Reuse `count` consecutive remote blocks starting at `remote_block_index`.
    CopyBlock { remote_block_index: u32, count: u32 },
    /// Bytes to write verbatim.
    Literal { bytes: Vec<u8> },
}

/// Sign `reader` in blocks of `block_size`. The tail block may be shorter.
pub fn compute_signatures<R: Read>(
    mut reader: R,
    block_size: u32,
    checksum_type: ChecksumType,
) -> std::io::Result<Vec<BlockSignature>> {
    let mut sigs = Vec::new();
    let mut buf = vec![0u8; block_size as usize];
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        sigs.push(BlockSignature {
            weak: weak_checksum(block),
            strong: strong_checksum(block, checksum_type),
        });
        if n < buf.len() {
            break;
        }
    }
    Ok(sigs)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Accumulates instructions: coalesces adjacent copies, chunks literals.
struct DeltaSink {
    instrs: Vec<DeltaInstruction>,
    pending: Vec<u8>,
    last_copy_end: Option<u32>,
}

impl DeltaSink {
    fn new() -> Self {
        Self {
            instrs: Vec::new(),
            pending: Vec::new(),
            last_copy_end: None,
        }
    }

    /// Remote block index that would extend the previous copy run.
    fn preferred_index(&self) -> Option<u32> {
        self.last_copy_end
    }

    fn literal(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while self.pending.len() >= MAX_LITERAL {
            let rest = self.pending.split_off(MAX_LITERAL);
            let chunk = std::mem::replace(&mut self.pending, rest);
            self.instrs.push(DeltaInstruction::Literal { bytes: chunk });
        }
    }

    fn copy(&mut self, index: u32) {
        self.flush_pending();
        match self.instrs.last_mut() {
            Some(DeltaInstruction::CopyBlock {
                remote_block_index,
                count,
            }) if *remote_block_index + *count == index => *count += 1,
            _ => self.instrs.push(DeltaInstruction::CopyBlock {
                remote_block_index: index,
                count: 1,
            }),
        }
        self.last_copy_end = Some(index + 1);
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let bytes = std::mem::take(&mut self.pending);
            self.instrs.push(DeltaInstruction::Literal { bytes });
        }
    }

    fn finish(mut self) -> Vec<DeltaInstruction> {
        self.flush_pending();
        self.instrs
    }
}

/// Compute the delta of `source` against the remote signatures.
///
/// The local tail shorter than one block is always literal; a weak hit is
/// confirmed with the strong digest before a copy is emitted.
pub fn compute_delta(
    source: &[u8],
    sigs: &[BlockSignature],
    block_size: u32,
    checksum_type: ChecksumType,
) -> Vec<DeltaInstruction> {
    let b = block_size as usize;
    let mut sink = DeltaSink::new();

    if sigs.is_empty() || source.len() < b {
        sink.literal(source);
        return sink.finish();
    }

    let mut table: HashMap<u32, Vec<u32>> = HashMap::new();
    for (i, sig) in sigs.iter().enumerate() {
        table.entry(sig.weak).or_default().push(i as u32);
    }

    let last_start = source.len() - b;
    let mut rolling = RollingChecksum::new(b);
    rolling.init(&source[..b]);
    let mut offset = 0usize;

    while offset <= last_start {
        let mut matched = None;
        if let Some(candidates) = table.get(&rolling.value()) {
            let window = &source[offset..offset + b];
            let strong = strong_checksum(window, checksum_type);
            // Prefer the block that extends the current run so that
            // repeated content coalesces into one copy instruction.
            if let Some(p) = sink.preferred_index() {
                if candidates.contains(&p) && sigs[p as usize].strong == strong {
                    matched = Some(p);
                }
            }
            if matched.is_none() {
                matched = candidates
                    .iter()
                    .copied()
                    .find(|&i| sigs[i as usize].strong == strong);
            }
        }

        match matched {
            Some(index) => {
                sink.copy(index);
                offset += b;
                if offset <= last_start {
                    rolling.init(&source[offset..offset + b]);
                }
            }
            None => {
                sink.literal(&source[offset..offset + 1]);
                if offset < last_start {
                    rolling.roll(source[offset], source[offset + b]);
                }
                offset += 1;
            }
        }
    }

    sink.literal(&source[offset..]);
    sink.finish()
}

/// Replays instructions against the old file content.
pub struct DeltaApplier<R: Read + Seek> {
    basis: R,
    block_size: u64,
    written: u64,
}

impl<R: Read + Seek> DeltaApplier<R> {
    pub fn new(basis: R, block_size: u32) -> Self {
        Self {
            basis,
            block_size: block_size as u64,
            written: 0,
        }
    }

    /// Bytes of output produced so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn apply<W: Write>(&mut self, instr: &DeltaInstruction, out: &mut W) -> Result<()> {
        match instr {
            DeltaInstruction::CopyBlock {
                remote_block_index,
                count,
            } => {
                let start = *remote_block_index as u64 * self.block_size;
                let len = *count as u64 * self.block_size;
                self.basis
                    .seek(SeekFrom::Start(start))
                    .map_err(SyncError::LocalIo)?;
                let mut part = (&mut self.basis).take(len);
                let copied = std::io::copy(&mut part, out).map_err(SyncError::LocalIo)?;
                if copied != len {
                    return Err(SyncError::Protocol(format!(
                        "copy instruction out of range: blocks {}..{} exceed old file",
                        remote_block_index,
                        remote_block_index + count
                    )));
                }
                self.written += len;
            }
            DeltaInstruction::Literal { bytes } => {
                out.write_all(bytes).map_err(SyncError::LocalIo)?;
                self.written += bytes.len() as u64;
            }
        }
        Ok(())
    }
}

// --- wire codecs ---

pub fn encode_signatures(idx: u32, block_size: u32, sigs: &[BlockSignature]) -> Vec<u8> {
    let digest_len = sigs.first().map(|s| s.strong.len()).unwrap_or(0);
    let mut buf = Vec::with_capacity(12 + sigs.len() * (4 + digest_len));
    put_u32(&mut buf, idx);
    put_u32(&mut buf, block_size);
    put_u32(&mut buf, sigs.len() as u32);
    for sig in sigs {
        put_u32(&mut buf, sig.weak);
        buf.extend_from_slice(&sig.strong);
    }
    buf
}

pub fn decode_signatures(payload: &[u8]) -> Result<(u32, u32, Vec<BlockSignature>)> {
    let mut r = PayloadReader::new(payload);
    let idx = r.u32()?;
    let block_size = r.u32()?;
    let count = r.u32()? as usize;
    if count == 0 {
        r.expect_end()?;
        return Ok((idx, block_size, Vec::new()));
    }
    if r.remaining() % count != 0 {
        return Err(SyncError::Protocol("ragged signature payload".into()));
    }
    let per = r.remaining() / count;
    let digest_len = per
        .checked_sub(4)
        .filter(|l| ChecksumType::from_digest_len(*l).is_some())
        .ok_or_else(|| SyncError::Protocol(format!("bad signature digest width {per}")))?;
    let mut sigs = Vec::with_capacity(count);
    for _ in 0..count {
        let weak = r.u32()?;
        let strong = r.bytes(digest_len)?.to_vec();
        sigs.push(BlockSignature { weak, strong });
    }
    r.expect_end()?;
    Ok((idx, block_size, sigs))
}

pub fn encode_delta(idx: u32, instrs: &[DeltaInstruction]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, idx);
    put_u32(&mut buf, instrs.len() as u32);
    for instr in instrs {
        match instr {
            DeltaInstruction::CopyBlock {
                remote_block_index,
                count,
            } => {
                buf.push(0);
                put_u32(&mut buf, *remote_block_index);
                put_u32(&mut buf, *count);
            }
            DeltaInstruction::Literal { bytes } => {
                buf.push(1);
                put_u32(&mut buf, bytes.len() as u32);
                buf.extend_from_slice(bytes);
            }
        }
    }
    buf
}

pub fn decode_delta(payload: &[u8]) -> Result<(u32, Vec<DeltaInstruction>)> {
    let mut r = PayloadReader::new(payload);
    let idx = r.u32()?;
    let count = r.u32()? as usize;
    let mut instrs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        match r.u8()? {
            0 => {
                let remote_block_index = r.u32()?;
                let count = r.u32()?;
                instrs.push(DeltaInstruction::CopyBlock {
                    remote_block_index,
                    count,
                });
            }
            1 => {
                let len = r.u32()? as usize;
                if len > MAX_LITERAL {
                    return Err(SyncError::Protocol(format!(
                        "literal of {len} bytes exceeds chunk limit"
                    )));
                }
                let bytes = r.bytes(len)?.to_vec();
                instrs.push(DeltaInstruction::Literal { bytes });
            }
            k => return Err(SyncError::Protocol(format!("unknown instruction kind {k}"))),
        }
    }
    r.expect_end()?;
    Ok((idx, instrs))
}
