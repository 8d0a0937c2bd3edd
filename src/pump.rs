//! Framed message pump with a bracketed compression layer.
//!
//! Wire layout, little-endian: `u16 tag | u32 length | payload`. Between
//! `StartCompress` and `StopCompress` every payload passes through one
//! persistent zstd stream, flushed per frame so the peer can decode each
//! payload as it arrives; tag and length stay readable, and the length field
//! holds the on-wire (compressed) payload size. Bracket frames themselves
//! always travel uncompressed.

use std::io::{Read, Write};

use zstd::stream::write::{Decoder, Encoder};

use crate::error::{Result, SyncError};
use crate::protocol::{tag, MAX_FRAME_SIZE};

pub struct MessagePump<S: Read + Write> {
    stream: S,
    tx: Option<Encoder<'static, Vec<u8>>>,
    rx: Option<Decoder<'static, Vec<u8>>>,
    bytes_sent: u64,
    bytes_received: u64,
}

fn transport(e: std::io::Error) -> SyncError {
    SyncError::TransportLost(e.to_string())
}

impl<S: Read + Write> MessagePump<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            tx: None,
            rx: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    fn write_frame(&mut self, frame_tag: u16, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "frame payload of {} bytes exceeds cap",
                payload.len()
            )));
        }
        let mut header = [0u8; 6];
        header[0..2].copy_from_slice(&frame_tag.to_le_bytes());
        header[2..6].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.stream.write_all(&header).map_err(transport)?;
        self.stream.write_all(payload).map_err(transport)?;
        self.bytes_sent += 6 + payload.len() as u64;
        Ok(())
    }

    /// Send one message; compressed transparently while a bracket is open.
    pub fn send(&mut self, frame_tag: u16, payload: &[u8]) -> Result<()> {
        if let Some(enc) = &mut self.tx {
            enc.write_all(payload)
                .and_then(|_| enc.flush())
                .map_err(|e| SyncError::Protocol(format!("compression failed: {e}")))?;
            let wire = std::mem::take(enc.get_mut());
            self.write_frame(frame_tag, &wire)
        } else {
            self.write_frame(frame_tag, payload)
        }
    }

    /// Open the write-side compression bracket.
    pub fn begin_compress(&mut self, level: u8) -> Result<()> {
        if self.tx.is_some() {
            return Err(SyncError::Protocol(
                "compression started while already active".into(),
            ));
        }
        self.write_frame(tag::START_COMPRESS, &[level])?;
        let enc = Encoder::new(Vec::new(), level as i32)
            .map_err(|e| SyncError::Protocol(format!("zstd encoder: {e}")))?;
        self.tx = Some(enc);
        Ok(())
    }

    /// Flush and close the write-side bracket.
    pub fn end_compress(&mut self) -> Result<()> {
        let enc = self.tx.take().ok_or_else(|| {
            SyncError::Protocol("compression stopped while not active".into())
        })?;
        // Every payload was flushed at its frame boundary; the stream
        // epilogue carries no data the peer still needs.
        enc.finish()
            .map_err(|e| SyncError::Protocol(format!("zstd finish: {e}")))?;
        self.write_frame(tag::STOP_COMPRESS, &[])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(transport)
    }

    /// Receive the next message, handling bracket transitions internally.
    /// Blocks until a full frame is available; EOF fails the session.
    pub fn recv(&mut self) -> Result<(u16, Vec<u8>)> {
        loop {
            let mut header = [0u8; 6];
            self.read_exact(&mut header)?;
            let frame_tag = u16::from_le_bytes([header[0], header[1]]);
            let len = u32::from_le_bytes([header[2], header[3], header[4], header[5]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(SyncError::Protocol(format!(
                    "incoming frame of {len} bytes exceeds cap"
                )));
            }
            let mut payload = vec![0u8; len];
            self.read_exact(&mut payload)?;
            self.bytes_received += 6 + len as u64;

            match frame_tag {
                tag::START_COMPRESS => {
                    if self.rx.is_some() {
                        return Err(SyncError::Protocol(
                            "nested compression start from peer".into(),
                        ));
                    }
                    if payload.len() != 1 {
                        return Err(SyncError::Protocol("malformed compression start".into()));
                    }
                    let dec = Decoder::new(Vec::new())
                        .map_err(|e| SyncError::Protocol(format!("zstd decoder: {e}")))?;
                    self.rx = Some(dec);
                }
                tag::STOP_COMPRESS => {
                    if self.rx.take().is_none() {
                        return Err(SyncError::Protocol(
                            "compression stop without matching start".into(),
                        ));
                    }
                }
                _ => {
                    if let Some(dec) = &mut self.rx {
                        dec.write_all(&payload).and_then(|_| dec.flush()).map_err(
                            |e| SyncError::Protocol(format!("corrupt compressed payload: {e}")),
                        )?;
                        let logical = std::mem::take(dec.get_mut());
                        return Ok((frame_tag, logical));
                    }
                    return Ok((frame_tag, payload));
                }
            }
        }
    }
}
