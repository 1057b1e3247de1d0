// End-to-end sync scenarios against the in-memory backend

use crate::support::{fast_opts, mod_time, Harness};
use driftsync::backend::memory::Op;
use driftsync::reporter::Event;
use driftsync::{EngineContext, ErrorKind, HashKind};
use std::time::Duration;

#[tokio::test]
async fn test_fresh_copy_transfers_everything() {
    let harness = Harness::new();
    harness.src.seed("a.txt", &[7u8; 10], mod_time(0));
    harness.src.seed("dir/b.bin", &[42u8; 1024 * 1024], mod_time(5));

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 2);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.bytes, 10 + 1024 * 1024);
    assert_eq!(summary.exit_code(), 0);

    for path in ["a.txt", "dir/b.bin"] {
        let src_obj = harness.src.object(path).unwrap();
        let dst_obj = harness.dst.object(path).unwrap();
        assert_eq!(src_obj.size, dst_obj.size, "size mismatch for {path}");
        assert_eq!(
            src_obj.hash(HashKind::Md5),
            dst_obj.hash(HashKind::Md5),
            "hash mismatch for {path}"
        );
        assert_eq!(src_obj.mod_time, dst_obj.mod_time, "mtime mismatch for {path}");
    }
}

#[tokio::test]
async fn test_unchanged_resync_is_all_checks() {
    let harness = Harness::new();
    harness.src.seed("a.txt", &[7u8; 10], mod_time(0));
    harness.src.seed("dir/b.bin", &[42u8; 4096], mod_time(5));

    harness.sync().await;
    let (second, _) = harness.sync().await;

    assert_eq!(second.transferred, 0);
    assert_eq!(second.checks, 2);
    assert_eq!(second.errors, 0);
    assert_eq!(second.bytes, 0);
}

#[tokio::test]
async fn test_update_by_content_beats_equal_mtime() {
    let harness = Harness::new();
    harness.src.seed("a.txt", b"0123456789", mod_time(0));
    harness.sync().await;

    // Replace content, same size, same mtime.
    harness.src.seed("a.txt", b"9876543210", mod_time(0));
    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 1);
    assert_eq!(harness.dst.contents("a.txt").unwrap(), b"9876543210");
}

#[tokio::test]
async fn test_delete_propagation_runs_after_checks() {
    let harness = Harness::new();
    harness.src.seed("a.txt", b"keep", mod_time(0));
    harness.dst.seed("a.txt", b"keep", mod_time(0));
    harness.dst.seed("stale.txt", b"old", mod_time(0));

    let (summary, reporter) = harness.sync().await;

    assert_eq!(summary.deletes, 1);
    assert_eq!(harness.dst.file_paths(), vec!["a.txt"]);

    // The delete happened only after a.txt was verified present.
    let events = reporter.events();
    let checked_at = events
        .iter()
        .position(|e| matches!(e, Event::Skipped { path, .. } if path == "a.txt"))
        .expect("a.txt should have been checked");
    let deleted_at = events
        .iter()
        .position(|e| matches!(e, Event::Deleted { path } if path == "stale.txt"))
        .expect("stale.txt should have been deleted");
    assert!(checked_at < deleted_at);
}

#[tokio::test]
async fn test_transient_failures_during_multipart_upload() {
    let mut opts = fast_opts();
    opts.multipart_threshold = 8;
    opts.multipart_chunk = 4;
    opts.multipart_concurrency = 2;
    let harness = Harness::with_opts(opts);

    let payload = b"0123456789ab"; // three parts of four bytes
    harness.src.seed("big.bin", payload, mod_time(0));
    harness
        .dst
        .inject_fault(Op::UploadPart, None, ErrorKind::Transient, 2);

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.transferred, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(harness.dst.contents("big.bin").unwrap(), payload);
    // Bytes counted once at read time; part retries re-send but never
    // decrement or double-count.
    assert_eq!(summary.bytes, payload.len() as u64);
    assert_eq!(harness.dst.open_sessions(), 0);
}

#[tokio::test]
async fn test_checksum_mismatch_fails_and_removes_destination() {
    let harness = Harness::new();
    harness.src.seed("bad.bin", b"content", mod_time(0));
    harness.dst.report_wrong_hash("bad.bin");

    let (summary, reporter) = harness.sync().await;

    assert_eq!(summary.transferred, 0);
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.errors_by_kind[&ErrorKind::Checksum], 1);
    assert_eq!(summary.exit_code(), 6);
    assert!(harness.dst.contents("bad.bin").is_none());

    // One ordinary attempt plus exactly one checksum retry.
    let failed = reporter
        .events()
        .into_iter()
        .find_map(|e| match e {
            Event::Failed { path, kind, attempts } if path == "bad.bin" => Some((kind, attempts)),
            _ => None,
        })
        .expect("transfer should have failed");
    assert_eq!(failed.0, ErrorKind::Checksum);
    assert_eq!(failed.1, 2);
}

#[tokio::test]
async fn test_idempotent_after_faulty_first_pass() {
    let harness = Harness::new();
    harness.src.seed("x.bin", &[1u8; 2048], mod_time(0));
    harness.src.seed("y.bin", &[2u8; 2048], mod_time(0));
    harness.dst.inject_fault(Op::Put, None, ErrorKind::Transient, 1);

    let (first, _) = harness.sync().await;
    assert_eq!(first.transferred, 2);
    assert_eq!(first.errors, 0);

    let (second, _) = harness.sync().await;
    assert_eq!(second.transferred, 0);
    assert_eq!(second.checks, 2);
}

#[tokio::test]
async fn test_dry_run_plans_the_same_actions() {
    fn plan_of(reporter: &driftsync::MemoryReporter) -> Vec<(String, String)> {
        reporter
            .planned_actions()
            .iter()
            .map(|action| (action.describe().to_string(), action.path().to_string()))
            .collect()
    }

    let build = || {
        let harness = Harness::new();
        harness.src.seed("new.txt", b"new", mod_time(0));
        harness.src.seed("same.txt", b"same", mod_time(0));
        harness.src.seed("changed.txt", b"after", mod_time(9));
        harness.dst.seed("same.txt", b"same", mod_time(0));
        harness.dst.seed("changed.txt", b"befor", mod_time(1));
        harness.dst.seed("stale.txt", b"stale", mod_time(0));
        harness
    };

    let mut dry = fast_opts();
    dry.dry_run = true;
    let dry_harness = build();
    let dry_harness = Harness {
        src: dry_harness.src,
        dst: dry_harness.dst,
        opts: dry,
    };
    let (dry_summary, dry_reporter) = dry_harness.sync().await;

    let real_harness = build();
    let (real_summary, real_reporter) = real_harness.sync().await;

    assert_eq!(plan_of(&dry_reporter), plan_of(&real_reporter));
    // Dry run touched nothing.
    assert_eq!(dry_summary.transferred, 0);
    assert_eq!(dry_summary.deletes, 0);
    assert!(dry_harness.dst.contents("new.txt").is_none());
    assert!(dry_harness.dst.contents("stale.txt").is_some());
    // The real run did everything the plan said.
    assert_eq!(real_summary.transferred, 2);
    assert_eq!(real_summary.deletes, 1);
}

#[tokio::test]
async fn test_cancellation_drains_and_reports() {
    let mut opts = fast_opts();
    opts.retry_base = Duration::from_millis(20);
    opts.low_level_retries = 1000;
    let harness = Harness::with_opts(opts.clone());
    harness.src.seed("slow.bin", &[1u8; 4096], mod_time(0));
    // Keep the transfer stuck in its low-level backoff loop until cancelled.
    harness
        .dst
        .inject_fault(Op::Stat, None, ErrorKind::Transient, 10_000);

    let ctx = EngineContext::new(opts);
    let cancel = ctx.cancel.clone();
    let run = harness.sync_with_ctx(&ctx);
    tokio::pin!(run);

    let summary = tokio::select! {
        biased;
        _ = tokio::time::sleep(Duration::from_millis(60)) => {
            cancel.cancel();
            tokio::time::timeout(Duration::from_secs(5), run)
                .await
                .expect("engine did not drain within the grace window")
                .expect("cancelled run still returns a summary")
        }
        done = &mut run => done.expect("run finished before cancellation"),
    };

    assert!(summary.cancelled);
    assert_eq!(summary.exit_code(), 9);
    assert!(harness.dst.contents("slow.bin").is_none());
    assert_eq!(harness.dst.open_sessions(), 0);
}

#[tokio::test]
async fn test_failed_transfer_leaves_no_partial_at_final_path() {
    let mut opts = fast_opts();
    opts.retries = 1;
    let harness = Harness::with_opts(opts);
    // Non-atomic destination forces the temp-and-rename path.
    let dst = std::sync::Arc::new(
        driftsync::backend::memory::MemoryBackend::new("dst2")
            .with_caps(|caps| caps.atomic_overwrite = false),
    );
    let harness = Harness {
        src: harness.src,
        dst,
        opts: harness.opts,
    };
    harness.src.seed("f.bin", &[9u8; 512], mod_time(0));
    // Fail the publish rename once; the single transfer attempt gives up.
    harness
        .dst
        .inject_fault(Op::Rename, None, ErrorKind::NoRetry, 1);

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.errors, 1);
    assert!(harness.dst.file_paths().is_empty(), "no temp or final object may remain");
}
