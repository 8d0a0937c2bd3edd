//! Per-run session state: the socket, cancellation, and transfer counters.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::protocol::{put_u32, put_u64, PayloadReader};
use crate::pump::MessagePump;

/// Cooperative cancellation, polled between messages and before each file.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Client-side counters surfaced to progress and logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TransferStats {
    pub files_examined: u64,
    pub files_sent: u64,
    pub files_delta: u64,
    pub files_deleted: u64,
    /// Uncompressed bytes of file content handed to the transport.
    pub raw_bytes: u64,
}

/// Final accounting reported by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Summary {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ok: u32,
    pub failed: u32,
}

impl Summary {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        put_u64(&mut buf, self.bytes_in);
        put_u64(&mut buf, self.bytes_out);
        put_u32(&mut buf, self.ok);
        put_u32(&mut buf, self.failed);
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Summary> {
        let mut r = PayloadReader::new(payload);
        let summary = Summary {
            bytes_in: r.u64()?,
            bytes_out: r.u64()?,
            ok: r.u32()?,
            failed: r.u32()?,
        };
        r.expect_end()?;
        Ok(summary)
    }
}

/// One session per client invocation. Owns the socket and, while a bracket
/// is open, the compressor inside the pump.
pub struct Session {
    pub pump: MessagePump<TcpStream>,
    pub cancel: CancelFlag,
    pub stats: TransferStats,
}

impl Session {
    pub fn from_stream(stream: TcpStream, cancel: CancelFlag) -> Self {
        Self {
            pump: MessagePump::new(stream),
            cancel,
            stats: TransferStats::default(),
        }
    }

    pub fn connect(addr: SocketAddr, timeout: Duration, cancel: CancelFlag) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| SyncError::TransportLost(format!("connect {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self::from_stream(stream, cancel))
    }

    /// Best-effort close of both socket halves.
    pub fn shutdown(&mut self) {
        let _ = self.pump.stream_mut().shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_round_trip() {
        let s = Summary {
            bytes_in: 1 << 40,
            bytes_out: 123,
            ok: 7,
            failed: 1,
        };
        assert_eq!(Summary::decode(&s.encode()).unwrap(), s);
    }

    #[test]
    fn cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(matches!(flag.check(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn summary_rejects_short_payload() {
        assert!(Summary::decode(&[0u8; 10]).is_err());
    }
}
