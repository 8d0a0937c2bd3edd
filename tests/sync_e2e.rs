//! End-to-end sync runs: the real client phase machine against the real
//! worker session over loopback TCP.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;

use filetime::FileTime;
use walkdir::WalkDir;

use remit::client::SyncClient;
use remit::error::Result;
use remit::filter::AcceptAll;
use remit::logger::NoopLogger;
use remit::options::SyncOptions;
use remit::progress::SilentSink;
use remit::server;
use remit::session::{CancelFlag, Session, Summary, TransferStats};

fn write(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn run_sync(
    sources: &[PathBuf],
    root: &Path,
    opts: SyncOptions,
) -> (Result<Summary>, TransferStats, Result<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_root = root.to_path_buf();
    let server_thread = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server::run_connection(stream, &server_root)
    });

    let stream = TcpStream::connect(addr).unwrap();
    let session = Session::from_stream(stream, CancelFlag::new());
    let mut client = SyncClient::new(
        session,
        sources.to_vec(),
        opts,
        &AcceptAll,
        &NoopLogger,
        &SilentSink,
    );
    let result = client.run();
    let stats = client.stats();
    let server_result = server_thread.join().unwrap();
    (result, stats, server_result)
}

fn recursive() -> SyncOptions {
    SyncOptions {
        recursive: true,
        ..Default::default()
    }
}

fn assert_no_temp_files(root: &Path) {
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy();
        assert!(
            !name.ends_with(".tmp"),
            "temp sibling left behind: {}",
            entry.path().display()
        );
    }
}

#[test]
fn fresh_sync_then_no_op() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    write(&client_dir.path().join("a.txt"), b"hello\n");
    write(&client_dir.path().join("sub/b.bin"), &[0u8; 1024]);

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    let summary = result.unwrap();

    assert_eq!(summary.ok, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(stats.files_sent, 2);
    assert_eq!(
        fs::read(remote_dir.path().join("a.txt")).unwrap(),
        b"hello\n"
    );
    assert_eq!(
        fs::read(remote_dir.path().join("sub/b.bin")).unwrap(),
        vec![0u8; 1024]
    );
    assert_no_temp_files(remote_dir.path());

    // Second pass over an unchanged tree moves no file content at all
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    let summary = result.unwrap();
    assert_eq!(summary.ok, 0);
    assert_eq!(stats.files_sent, 0);
    assert_eq!(stats.files_delta, 0);
    assert_eq!(stats.raw_bytes, 0);
}

#[test]
fn small_edit_goes_by_delta() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let local = client_dir.path().join("big.bin");
    write(&local, &vec![0x41u8; 10 * 1024]);

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 1);

    // Same size, ten bytes replaced, mtime pushed well past the tolerance
    let mut edited = vec![0x41u8; 10 * 1024];
    for byte in &mut edited[5000..5010] {
        *byte = 0x42;
    }
    write(&local, &edited);
    let md = fs::metadata(&local).unwrap();
    let bumped = FileTime::from_unix_time(
        FileTime::from_last_modification_time(&md).unix_seconds() + 10,
        0,
    );
    filetime::set_file_mtime(&local, bumped).unwrap();

    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    let summary = result.unwrap();

    assert_eq!(summary.ok, 1);
    assert_eq!(stats.files_delta, 1);
    assert_eq!(stats.files_sent, 0);
    // Only the damaged region plus the unaligned tail travel as literals
    assert!(
        stats.raw_bytes < 2048,
        "sent {} literal bytes for a 10-byte edit",
        stats.raw_bytes
    );
    assert_eq!(fs::read(remote_dir.path().join("big.bin")).unwrap(), edited);
    assert_no_temp_files(remote_dir.path());
}

#[test]
fn delete_removes_remote_extras() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    write(&client_dir.path().join("a.txt"), b"keep");
    write(&remote_dir.path().join("gone.txt"), b"bye");

    let sources = vec![client_dir.path().to_path_buf()];
    let opts = SyncOptions {
        delete_extras: true,
        ..recursive()
    };
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), opts);
    server_result.unwrap();
    result.unwrap();

    assert!(!remote_dir.path().join("gone.txt").exists());
    assert!(remote_dir.path().join("a.txt").exists());
    assert_eq!(stats.files_deleted, 1);
}

#[test]
fn delete_without_flag_keeps_extras() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    write(&client_dir.path().join("a.txt"), b"keep");
    write(&remote_dir.path().join("gone.txt"), b"stay");

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    result.unwrap();
    assert!(remote_dir.path().join("gone.txt").exists());
}

#[test]
fn checksum_flag_catches_stale_content() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let local = client_dir.path().join("a.txt");
    let remote = remote_dir.path().join("a.txt");
    write(&local, b"aaaa");
    write(&remote, b"bbbb");

    // Equal size, mtime, and permissions: metadata cannot tell them apart
    let md = fs::metadata(&local).unwrap();
    fs::set_permissions(&remote, md.permissions()).unwrap();
    filetime::set_file_mtime(&remote, FileTime::from_last_modification_time(&md)).unwrap();

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 0);
    assert_eq!(fs::read(&remote).unwrap(), b"bbbb", "stale copy kept");

    let opts = SyncOptions {
        checksum: true,
        ..recursive()
    };
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), opts);
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 1);
    assert_eq!(fs::read(&remote).unwrap(), b"aaaa");
}

#[test]
fn dry_run_changes_nothing() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    write(&client_dir.path().join("a.txt"), b"data");
    write(&remote_dir.path().join("gone.txt"), b"still here");

    let sources = vec![client_dir.path().to_path_buf()];
    let opts = SyncOptions {
        dry_run: true,
        delete_extras: true,
        ..recursive()
    };
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), opts);
    server_result.unwrap();
    let summary = result.unwrap();

    assert_eq!(summary.ok, 1, "one file would transfer");
    assert!(!remote_dir.path().join("a.txt").exists());
    assert!(remote_dir.path().join("gone.txt").exists());
}

#[test]
fn existing_skips_new_files() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    write(&client_dir.path().join("new.txt"), b"n");

    let sources = vec![client_dir.path().to_path_buf()];
    let opts = SyncOptions {
        existing: true,
        ..recursive()
    };
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), opts);
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 0);
    assert_eq!(stats.files_sent, 0);
    assert!(!remote_dir.path().join("new.txt").exists());
}

#[test]
fn whole_file_flag_skips_delta_phase() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let local = client_dir.path().join("a.bin");
    write(&local, &vec![1u8; 4096]);

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    result.unwrap();

    write(&local, &vec![2u8; 4096]);
    let md = fs::metadata(&local).unwrap();
    let bumped = FileTime::from_unix_time(
        FileTime::from_last_modification_time(&md).unix_seconds() + 10,
        0,
    );
    filetime::set_file_mtime(&local, bumped).unwrap();

    let opts = SyncOptions {
        whole_file: true,
        ..recursive()
    };
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), opts);
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 1);
    assert_eq!(stats.files_sent, 1);
    assert_eq!(stats.files_delta, 0);
    assert_eq!(fs::read(remote_dir.path().join("a.bin")).unwrap(), vec![2u8; 4096]);
}

#[test]
fn awkward_names_and_sizes_survive() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();

    let cases: Vec<(String, Vec<u8>)> = vec![
        ("empty.bin".to_string(), Vec::new()),
        ("one.bin".to_string(), vec![7u8]),
        ("with space/ünïcode näme.txt".to_string(), b"text".to_vec()),
        ("block-1023.bin".to_string(), vec![3u8; 1023]),
        ("block-1024.bin".to_string(), vec![4u8; 1024]),
        ("block-1025.bin".to_string(), vec![5u8; 1025]),
        (
            "block-16x.bin".to_string(),
            (0..16 * 1024u32).map(|i| (i % 251) as u8).collect(),
        ),
    ];
    for (name, content) in &cases {
        write(&client_dir.path().join(name), content);
    }

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, cases.len() as u32);

    for (name, content) in &cases {
        assert_eq!(
            fs::read(remote_dir.path().join(name)).unwrap(),
            *content,
            "mismatch for {name}"
        );
    }

    // And an unchanged re-run stays quiet
    let (result, stats, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 0);
    assert_eq!(stats.raw_bytes, 0);
}

#[test]
fn mtime_and_permissions_land_on_remote() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    let local = client_dir.path().join("exec.sh");
    write(&local, b"#!/bin/sh\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&local, fs::Permissions::from_mode(0o755)).unwrap();
    }
    filetime::set_file_mtime(&local, FileTime::from_unix_time(1_500_000_000, 0)).unwrap();

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    result.unwrap();

    let md = fs::metadata(remote_dir.path().join("exec.sh")).unwrap();
    assert_eq!(
        FileTime::from_last_modification_time(&md).unix_seconds(),
        1_500_000_000
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(md.permissions().mode() & 0o777, 0o755);
    }
}

#[test]
fn large_file_spans_multiple_frames() {
    let client_dir = tempfile::tempdir().unwrap();
    let remote_dir = tempfile::tempdir().unwrap();
    // Larger than one read chunk, incompressible enough to keep zstd honest
    let content: Vec<u8> = (0..5 * 1024 * 1024u32)
        .map(|i| (i.wrapping_mul(2654435761) >> 24) as u8)
        .collect();
    write(&client_dir.path().join("big.dat"), &content);

    let sources = vec![client_dir.path().to_path_buf()];
    let (result, _, server_result) = run_sync(&sources, remote_dir.path(), recursive());
    server_result.unwrap();
    assert_eq!(result.unwrap().ok, 1);
    assert_eq!(
        fs::read(remote_dir.path().join("big.dat")).unwrap(),
        content
    );
}
