// Planner policy coverage: delete ordering, rename tracking, resume,
// comparison modes, and the local backend end to end

use crate::support::{fast_opts, mod_time, Harness};
use driftsync::backend::local::LocalBackend;
use driftsync::backend::memory::{MemoryBackend, Op};
use driftsync::backend::Backend;
use driftsync::reporter::Event;
use driftsync::{DeleteMode, EngineContext, ErrorKind};
use std::sync::Arc;

#[tokio::test]
async fn test_delete_after_holds_deletes_when_a_transfer_fails() {
    let mut opts = fast_opts();
    opts.retries = 1;
    let harness = Harness::with_opts(opts);
    harness.src.seed("new.txt", b"new", mod_time(0));
    harness.dst.seed("stale.txt", b"stale", mod_time(0));
    harness
        .dst
        .inject_fault(Op::Put, Some("new.txt"), ErrorKind::NoRetry, 10);

    let (summary, _) = harness.sync().await;

    assert!(summary.errors >= 1);
    assert!(summary.deletes_skipped);
    assert_eq!(summary.deletes, 0);
    // The destination stayed a superset: nothing was removed.
    assert_eq!(harness.dst.contents("stale.txt").unwrap(), b"stale");
}

#[tokio::test]
async fn test_delete_before_removes_extras_first() {
    let mut opts = fast_opts();
    opts.delete_mode = DeleteMode::Before;
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.txt", b"a", mod_time(0));
    harness.dst.seed("stale.txt", b"stale", mod_time(0));

    let (summary, reporter) = harness.sync().await;

    assert_eq!(summary.deletes, 1);
    assert_eq!(summary.transferred, 1);

    let events = reporter.events();
    let deleted_at = events
        .iter()
        .position(|e| matches!(e, Event::Deleted { path } if path == "stale.txt"))
        .unwrap();
    let copied_at = events
        .iter()
        .position(|e| matches!(e, Event::Started { path, .. } if path == "a.txt"))
        .unwrap();
    assert!(deleted_at < copied_at);
}

#[tokio::test]
async fn test_delete_during_interleaves() {
    let mut opts = fast_opts();
    opts.delete_mode = DeleteMode::During;
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.txt", b"a", mod_time(0));
    harness.dst.seed("stale.txt", b"stale", mod_time(0));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.deletes, 1);
    assert_eq!(summary.transferred, 1);
    assert_eq!(harness.dst.file_paths(), vec!["a.txt"]);
}

#[tokio::test]
async fn test_copy_mode_keeps_destination_extras() {
    let harness = Harness::new();
    harness.src.seed("a.txt", b"a", mod_time(0));
    harness.dst.seed("extra.txt", b"extra", mod_time(0));

    let (summary, _) = harness.copy().await;

    assert_eq!(summary.transferred, 1);
    assert_eq!(summary.deletes, 0);
    assert_eq!(harness.dst.file_paths(), vec!["a.txt", "extra.txt"]);
}

#[tokio::test]
async fn test_size_only_mode_skips_same_size() {
    let mut opts = fast_opts();
    opts.size_only = true;
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.txt", b"AAAA", mod_time(0));
    harness.dst.seed("a.txt", b"BBBB", mod_time(900)); // same size, all else differs

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.checks, 1);
    assert_eq!(harness.dst.contents("a.txt").unwrap(), b"BBBB");
}

#[tokio::test]
async fn test_ignore_times_forces_recopy() {
    let mut opts = fast_opts();
    opts.ignore_times = true;
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.txt", b"same", mod_time(0));
    harness.dst.seed("a.txt", b"same", mod_time(0));

    let (summary, _) = harness.sync().await;
    assert_eq!(summary.transferred, 1);
}

#[tokio::test]
async fn test_track_renames_moves_instead_of_copying() {
    let mut opts = fast_opts();
    opts.track_renames = true;
    let harness = Harness::with_opts(opts);

    let payload = b"large enough to matter";
    harness.src.seed("renamed/new-name.bin", payload, mod_time(0));
    harness.dst.seed("old-name.bin", payload, mod_time(0));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.renames, 1);
    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.bytes, 0, "a rename moves no bytes through the engine");
    assert_eq!(
        harness.dst.contents("renamed/new-name.bin").unwrap(),
        payload
    );
    assert!(harness.dst.contents("old-name.bin").is_none());
}

#[tokio::test]
async fn test_journal_resume_skips_recorded_transfers() {
    let tmp = tempfile::tempdir().unwrap();
    let mut opts = fast_opts();
    opts.journal = Some(tmp.path().join("journal.jsonl"));
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.txt", b"hello", mod_time(0));

    let (first, _) = harness.sync().await;
    assert_eq!(first.transferred, 1);

    // Wipe the destination: without the journal this would re-copy.
    harness.dst.delete("a.txt").await.unwrap();
    let (second, reporter) = harness.sync().await;

    assert_eq!(second.transferred, 0);
    let journal_skips = reporter
        .events()
        .iter()
        .filter(|e| {
            matches!(e, Event::Skipped { reason, .. } if reason.contains("resume journal"))
        })
        .count();
    assert_eq!(journal_skips, 1);
}

#[tokio::test]
async fn test_max_transfer_stops_scheduling() {
    let mut opts = fast_opts();
    opts.transfers = 1;
    opts.max_transfer = Some(8);
    let harness = Harness::with_opts(opts);
    harness.src.seed("a.bin", &[1u8; 16], mod_time(0));
    harness.src.seed("b.bin", &[2u8; 16], mod_time(0));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 1);
    assert!(summary.limit_reached);
    assert_eq!(summary.exit_code(), 8);
}

#[tokio::test]
async fn test_mkdir_happens_before_children() {
    let harness = Harness::new();
    harness.src.seed_dir("only-dirs/empty");
    harness.src.seed("only-dirs/full/f.txt", b"f", mod_time(0));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 1);
    // Empty directories are preserved on a backend that supports them.
    let listed = harness.dst.list("only-dirs").await.unwrap();
    let names: Vec<_> = listed.iter().map(|e| e.name().to_string()).collect();
    assert!(names.contains(&"empty".to_string()));
    assert!(names.contains(&"full".to_string()));
}

#[tokio::test]
async fn test_rmdir_removes_empty_destination_dirs_last() {
    let harness = Harness::new();
    harness.dst.seed("gone/deep/file.txt", b"x", mod_time(0));
    harness.dst.seed_dir("gone");
    harness.dst.seed_dir("gone/deep");
    harness.src.seed("keep.txt", b"k", mod_time(0));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.errors, 0);
    assert_eq!(harness.dst.file_paths(), vec!["keep.txt"]);
    assert!(harness.dst.list("gone").await.is_err(), "directory tree should be gone");
}

#[tokio::test]
async fn test_local_to_memory_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
    std::fs::write(tmp.path().join("root.txt"), b"root file").unwrap();
    std::fs::write(tmp.path().join("sub/nested.txt"), b"nested file").unwrap();

    let src: Arc<dyn Backend> = Arc::new(LocalBackend::new(tmp.path()));
    let dst_mem = Arc::new(MemoryBackend::new("dst"));
    let dst: Arc<dyn Backend> = dst_mem.clone();

    let ctx = EngineContext::new(fast_opts());
    let summary = driftsync::sync(&ctx, src.clone(), dst.clone(), "").await.unwrap();
    assert_eq!(summary.transferred, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(dst_mem.contents("root.txt").unwrap(), b"root file");
    assert_eq!(dst_mem.contents("sub/nested.txt").unwrap(), b"nested file");

    // Second pass compares by mtime (local listings carry no digests) and
    // moves nothing.
    let ctx = EngineContext::new(fast_opts());
    let summary = driftsync::sync(&ctx, src, dst, "").await.unwrap();
    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.checks, 2);
}

#[tokio::test]
async fn test_bandwidth_limit_is_applied() {
    let mut opts = fast_opts();
    // 64 KiB/s with a 96 KiB payload: the first 64 KiB fits the bucket's
    // burst, the rest must wait roughly half a second.
    opts.bandwidth = driftsync::accounting::bandwidth::BandwidthLimit::per_second(64 * 1024);
    let harness = Harness::with_opts(opts);
    harness.src.seed("limited.bin", &[3u8; 96 * 1024], mod_time(0));

    let started = std::time::Instant::now();
    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 1);
    assert!(
        started.elapsed() >= std::time::Duration::from_millis(300),
        "limiter should have throttled the pump"
    );
}
