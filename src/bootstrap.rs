//! Remote worker lifecycle: reserve a tunnel port, launch the transport,
//! make sure the worker binary is present (deploying it once if not), wait
//! for it to listen, and tear everything down with the worker's exit code
//! and stderr tail in hand.
//!
//! Transport command construction is a collaborator behind `WorkerLauncher`;
//! the ssh flavour here is deliberately thin.

use std::collections::HashSet;
use std::io::BufRead;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, SyncError};
use crate::protocol::{LISTEN_MARKER, PROTO_MAJOR, VERSION_MARKER};
use crate::remote::RemoteDest;

pub const DEFAULT_PORT_RANGE: (u16, u16) = (44450, 44500);

/// Conventional worker location on the remote host.
pub const DEFAULT_REMOTE_BINARY: &str = ".cache/remit/remitd";

/// Port reservation across concurrent client processes. The shared-memory
/// implementation is a collaborator; this interface is all the core needs.
pub trait PortManager: Send + Sync {
    fn reserve(&self, first: u16, last: u16) -> Result<u16>;
    fn release(&self, port: u16);
}

/// In-process reservation with a loopback bind probe and bounded backoff.
pub struct ProbePorts {
    reserved: Mutex<HashSet<u16>>,
    attempts: u32,
    backoff: Duration,
}

impl Default for ProbePorts {
    fn default() -> Self {
        Self {
            reserved: Mutex::new(HashSet::new()),
            attempts: 5,
            backoff: Duration::from_millis(200),
        }
    }
}

impl PortManager for ProbePorts {
    fn reserve(&self, first: u16, last: u16) -> Result<u16> {
        for attempt in 0..self.attempts {
            {
                let mut reserved = self.reserved.lock().unwrap();
                for port in first..=last {
                    if reserved.contains(&port) {
                        continue;
                    }
                    if TcpListener::bind(("127.0.0.1", port)).is_ok() {
                        reserved.insert(port);
                        return Ok(port);
                    }
                }
            }
            thread::sleep(self.backoff * 2u32.pow(attempt));
        }
        Err(SyncError::ResourceExhausted(format!(
            "no free port in {first}-{last}"
        )))
    }

    fn release(&self, port: u16) {
        self.reserved.lock().unwrap().remove(&port);
    }
}

/// Starts the transport plus worker and stages the worker binary remotely.
pub trait WorkerLauncher {
    /// Launch the worker with its remote loopback port forwarded to
    /// `local_port`. stdout/stderr must be piped.
    fn start(&self, local_port: u16) -> Result<Child>;

    /// Copy the worker binary into place on the remote host.
    fn deploy(&self) -> Result<()>;
}

/// One ssh process does both jobs: forwards the port and execs the worker,
/// so the tunnel dies with the session.
pub struct SshLauncher {
    pub dest: RemoteDest,
    pub ip: String,
    pub remote_port: u16,
    pub remote_binary: String,
    pub local_binary: PathBuf,
}

impl SshLauncher {
    pub fn new(dest: RemoteDest, ip: String, remote_port: u16, local_binary: PathBuf) -> Self {
        Self {
            dest,
            ip,
            remote_port,
            remote_binary: DEFAULT_REMOTE_BINARY.to_string(),
            local_binary,
        }
    }
}

impl WorkerLauncher for SshLauncher {
    fn start(&self, local_port: u16) -> Result<Child> {
        Command::new("ssh")
            .arg("-L")
            .arg(format!("{local_port}:{}:{}", self.ip, self.remote_port))
            .arg(self.dest.login())
            .arg(format!(
                "{} serve --bind {} --port {} --root '{}'",
                self.remote_binary, self.ip, self.remote_port, self.dest.path
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SyncError::TransportLost(format!("launching ssh: {e}")))
    }

    fn deploy(&self) -> Result<()> {
        let dir = match self.remote_binary.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        };
        let mkdir = Command::new("ssh")
            .arg(self.dest.login())
            .arg(format!("mkdir -p '{dir}'"))
            .status()
            .map_err(|e| SyncError::TransportLost(format!("launching ssh: {e}")))?;
        if !mkdir.success() {
            return Err(SyncError::TransportLost("preparing remote directory".into()));
        }
        let scp = Command::new("scp")
            .arg("-q")
            .arg(&self.local_binary)
            .arg(format!("{}:{}", self.dest.login(), self.remote_binary))
            .status()
            .map_err(|e| SyncError::TransportLost(format!("launching scp: {e}")))?;
        if !scp.success() {
            return Err(SyncError::TransportLost("copying worker binary".into()));
        }
        let chmod = Command::new("ssh")
            .arg(self.dest.login())
            .arg(format!("chmod +x '{}'", self.remote_binary))
            .status()
            .map_err(|e| SyncError::TransportLost(format!("launching ssh: {e}")))?;
        if !chmod.success() {
            return Err(SyncError::TransportLost("marking worker executable".into()));
        }
        Ok(())
    }
}

/// Runs the worker binary directly on this machine; no tunnel involved.
/// Useful for same-host mirroring and exercised heavily by the test suite.
pub struct LocalLauncher {
    pub worker_binary: PathBuf,
    pub root: PathBuf,
}

impl WorkerLauncher for LocalLauncher {
    fn start(&self, local_port: u16) -> Result<Child> {
        Command::new(&self.worker_binary)
            .arg("serve")
            .arg("--port")
            .arg(local_port.to_string())
            .arg("--root")
            .arg(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SyncError::TransportLost(format!("launching worker: {e}")))
    }

    fn deploy(&self) -> Result<()> {
        Err(SyncError::TransportLost(
            "local worker binary is missing".into(),
        ))
    }
}

/// Worker exit state collected after the drain threads finished.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl WorkerReport {
    pub fn stderr_tail(&self, lines: usize) -> String {
        let start = self.stderr.len().saturating_sub(lines);
        self.stderr[start..].join("\n")
    }
}

/// A launched worker with its output pipes drained in the background.
/// The line buffers arrive over channels closed on pipe EOF, so they are
/// only readable once the worker is effectively gone.
pub struct WorkerProcess {
    child: Child,
    listening: Arc<AtomicBool>,
    version_mismatch: Arc<AtomicBool>,
    stdout_rx: Receiver<Vec<String>>,
    stderr_rx: Receiver<Vec<String>>,
}

impl WorkerProcess {
    pub fn attach(mut child: Child) -> Self {
        let listening = Arc::new(AtomicBool::new(false));
        let version_mismatch = Arc::new(AtomicBool::new(false));

        let stdout = child.stdout.take();
        let (stdout_tx, stdout_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut lines = Vec::new();
            if let Some(out) = stdout {
                for line in std::io::BufReader::new(out).lines().map_while(|l| l.ok()) {
                    lines.push(line);
                }
            }
            let _ = stdout_tx.send(lines);
        });

        let stderr = child.stderr.take();
        let (stderr_tx, stderr_rx) = mpsc::channel();
        let listen_flag = Arc::clone(&listening);
        let mismatch_flag = Arc::clone(&version_mismatch);
        thread::spawn(move || {
            let mut lines = Vec::new();
            if let Some(err) = stderr {
                for line in std::io::BufReader::new(err).lines().map_while(|l| l.ok()) {
                    if line.starts_with(LISTEN_MARKER) {
                        listen_flag.store(true, Ordering::SeqCst);
                    } else if let Some(version) = line.strip_prefix(VERSION_MARKER) {
                        let major = version
                            .trim()
                            .split('.')
                            .next()
                            .and_then(|m| m.parse::<u16>().ok());
                        if major != Some(PROTO_MAJOR) {
                            mismatch_flag.store(true, Ordering::SeqCst);
                        }
                    }
                    lines.push(line);
                }
            }
            let _ = stderr_tx.send(lines);
        });

        Self {
            child,
            listening,
            version_mismatch,
            stdout_rx,
            stderr_rx,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn version_mismatch(&self) -> bool {
        self.version_mismatch.load(Ordering::SeqCst)
    }

    fn try_exit(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            _ => None,
        }
    }

    /// Reap the process and collect the drained output. Blocks until both
    /// pipe readers saw EOF.
    fn join(mut self) -> WorkerReport {
        let exit_code = self.child.wait().ok().and_then(|s| s.code());
        let stdout = self.stdout_rx.recv().unwrap_or_default();
        let stderr = self.stderr_rx.recv().unwrap_or_default();
        WorkerReport {
            exit_code,
            stdout,
            stderr,
        }
    }

    fn kill_and_join(mut self) -> WorkerReport {
        let _ = self.child.kill();
        self.join()
    }

    /// Give the worker `grace` to exit on its own, then terminate it.
    pub fn shutdown(mut self, grace: Duration) -> WorkerReport {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.try_exit().is_some() {
                return self.join();
            }
            thread::sleep(Duration::from_millis(100));
        }
        self.kill_and_join()
    }
}

pub struct ActiveWorker {
    pub process: WorkerProcess,
    pub port: u16,
}

pub struct Bootstrapper<'a> {
    pub launcher: &'a dyn WorkerLauncher,
    pub ports: &'a dyn PortManager,
    pub port_range: (u16, u16),
    pub connect_timeout: Duration,
}

impl<'a> Bootstrapper<'a> {
    /// Bring the worker up and hand back a connected socket.
    ///
    /// A worker that dies before listening with a missing-binary exit status
    /// or a version-mismatch marker triggers exactly one deploy-and-retry.
    pub fn start(&self) -> Result<(ActiveWorker, TcpStream)> {
        let (first, last) = self.port_range;
        let port = self.ports.reserve(first, last)?;
        match self.start_attempt(port, true) {
            Ok(started) => Ok(started),
            Err(e) => {
                self.ports.release(port);
                Err(e)
            }
        }
    }

    fn start_attempt(&self, port: u16, allow_deploy: bool) -> Result<(ActiveWorker, TcpStream)> {
        let child = self.launcher.start(port)?;
        let mut process = WorkerProcess::attach(child);
        let started = Instant::now();
        let deadline = started + self.connect_timeout;
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();

        loop {
            if let Some(code) = process.try_exit() {
                let mismatch_flag = Arc::clone(&process.version_mismatch);
                // join() waits for pipe EOF, so the flag is settled after it
                let report = process.join();
                let needs_deploy =
                    code == 127 || code == 126 || mismatch_flag.load(Ordering::SeqCst);
                if needs_deploy && allow_deploy {
                    self.launcher.deploy()?;
                    return self.start_attempt(port, false);
                }
                return Err(SyncError::TransportLost(format!(
                    "worker exited with status {code} before accepting: {}",
                    report.stderr_tail(5)
                )));
            }

            if process.version_mismatch() {
                let report = process.kill_and_join();
                if allow_deploy {
                    self.launcher.deploy()?;
                    return self.start_attempt(port, false);
                }
                return Err(SyncError::TransportLost(format!(
                    "worker protocol mismatch persists after deploy: {}",
                    report.stderr_tail(5)
                )));
            }

            // Connect once the marker shows, or opportunistically after a
            // grace period in case stderr was swallowed by the transport
            let try_connect =
                process.is_listening() || started.elapsed() > Duration::from_secs(1);
            if try_connect {
                if let Ok(stream) = TcpStream::connect_timeout(&addr, Duration::from_millis(200))
                {
                    stream.set_nodelay(true).ok();
                    return Ok((ActiveWorker { process, port }, stream));
                }
            }

            if Instant::now() >= deadline {
                process.kill_and_join();
                return Err(SyncError::DeadlineExceeded(format!(
                    "worker not reachable on port {port} within {:?}",
                    self.connect_timeout
                )));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Tear the worker down after the session. The client is expected to
    /// have sent its shutdown frame already.
    pub fn stop(&self, worker: ActiveWorker) -> WorkerReport {
        let report = worker.process.shutdown(Duration::from_secs(5));
        self.ports.release(worker.port);
        report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    struct FixedPort(u16);

    impl PortManager for FixedPort {
        fn reserve(&self, _first: u16, _last: u16) -> Result<u16> {
            Ok(self.0)
        }
        fn release(&self, _port: u16) {}
    }

    /// Scripted stand-in for the ssh transport: optionally fails the first
    /// start with a missing-binary status, then pretends to listen.
    struct ScriptedLauncher {
        fail_starts: Mutex<u32>,
        deployed: AtomicBool,
    }

    impl ScriptedLauncher {
        fn failing(times: u32) -> Self {
            Self {
                fail_starts: Mutex::new(times),
                deployed: AtomicBool::new(false),
            }
        }
    }

    impl WorkerLauncher for ScriptedLauncher {
        fn start(&self, local_port: u16) -> Result<Child> {
            let mut remaining = self.fail_starts.lock().unwrap();
            let script = if *remaining > 0 {
                *remaining -= 1;
                "exit 127".to_string()
            } else {
                format!("echo '{LISTEN_MARKER} on 127.0.0.1:{local_port}' >&2; sleep 1")
            };
            Command::new("sh")
                .arg("-c")
                .arg(script)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| SyncError::TransportLost(e.to_string()))
        }

        fn deploy(&self) -> Result<()> {
            self.deployed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn listener_with_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn probe_ports_skips_occupied() {
        let (held, first) = listener_with_port();
        let ports = ProbePorts::default();
        // The held port is busy; the probe must move past it
        let got = ports.reserve(first, first + 10).unwrap();
        assert_ne!(got, first);
        ports.release(got);
        drop(held);
    }

    #[test]
    fn probe_ports_exhaustion() {
        let (held, first) = listener_with_port();
        let ports = ProbePorts {
            attempts: 1,
            backoff: Duration::from_millis(1),
            ..Default::default()
        };
        assert!(matches!(
            ports.reserve(first, first),
            Err(SyncError::ResourceExhausted(_))
        ));
        drop(held);
    }

    #[test]
    fn start_connects_once_marker_appears() {
        let (listener, port) = listener_with_port();
        let accept = thread::spawn(move || listener.accept().map(|_| ()));

        let launcher = ScriptedLauncher::failing(0);
        let ports = FixedPort(port);
        let boot = Bootstrapper {
            launcher: &launcher,
            ports: &ports,
            port_range: (port, port),
            connect_timeout: Duration::from_secs(5),
        };
        let (worker, stream) = boot.start().unwrap();
        drop(stream);
        accept.join().unwrap().unwrap();
        let report = boot.stop(worker);
        assert!(report
            .stderr
            .iter()
            .any(|l| l.starts_with(LISTEN_MARKER)));
        assert!(!launcher.deployed.load(Ordering::SeqCst));
    }

    #[test]
    fn missing_worker_deploys_once_and_retries() {
        let (listener, port) = listener_with_port();
        let accept = thread::spawn(move || listener.accept().map(|_| ()));

        let launcher = ScriptedLauncher::failing(1);
        let ports = FixedPort(port);
        let boot = Bootstrapper {
            launcher: &launcher,
            ports: &ports,
            port_range: (port, port),
            connect_timeout: Duration::from_secs(5),
        };
        let (worker, _stream) = boot.start().unwrap();
        accept.join().unwrap().unwrap();
        assert!(launcher.deployed.load(Ordering::SeqCst));
        boot.stop(worker);
    }

    #[test]
    fn second_start_failure_is_fatal() {
        let launcher = ScriptedLauncher::failing(2);
        let ports = FixedPort(1);
        let boot = Bootstrapper {
            launcher: &launcher,
            ports: &ports,
            port_range: (1, 1),
            connect_timeout: Duration::from_secs(2),
        };
        assert!(matches!(
            boot.start(),
            Err(SyncError::TransportLost(_))
        ));
        assert!(launcher.deployed.load(Ordering::SeqCst));
    }

    #[test]
    fn startup_timeout_is_deadline_exceeded() {
        // Worker never prints the marker and nothing listens on the port
        struct SilentLauncher;
        impl WorkerLauncher for SilentLauncher {
            fn start(&self, _local_port: u16) -> Result<Child> {
                Command::new("sh")
                    .arg("-c")
                    .arg("sleep 3")
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|e| SyncError::TransportLost(e.to_string()))
            }
            fn deploy(&self) -> Result<()> {
                unreachable!("no deploy expected")
            }
        }

        let (held, port) = listener_with_port();
        let free_port = port;
        drop(held);

        let launcher = SilentLauncher;
        let ports = FixedPort(free_port);
        let boot = Bootstrapper {
            launcher: &launcher,
            ports: &ports,
            port_range: (free_port, free_port),
            connect_timeout: Duration::from_millis(400),
        };
        assert!(matches!(
            boot.start(),
            Err(SyncError::DeadlineExceeded(_))
        ));
    }
}
