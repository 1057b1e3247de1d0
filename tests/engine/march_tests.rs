// Walker behavior through the full sync pipeline

use crate::support::{fast_opts, mod_time, Harness};
use driftsync::backend::memory::MemoryBackend;
use driftsync::backend::Backend;
use driftsync::march::March;
use driftsync::{EngineContext, ErrorKind};
use std::sync::Arc;

#[tokio::test]
async fn test_pairs_arrive_in_walk_order() {
    let src = Arc::new(MemoryBackend::new("src"));
    src.seed("zz.txt", b"z", mod_time(0));
    src.seed("a/1.txt", b"1", mod_time(0));
    src.seed("a/b/2.txt", b"2", mod_time(0));
    src.seed("m.txt", b"m", mod_time(0));
    let dst = Arc::new(MemoryBackend::new("dst"));
    dst.seed("a/stale.txt", b"s", mod_time(0));

    let ctx = EngineContext::new(fast_opts());
    let src_dyn: Arc<dyn Backend> = src.clone();
    let dst_dyn: Arc<dyn Backend> = dst.clone();
    let mut rx = March::new(ctx, src_dyn, dst_dyn, "").run();

    let mut paths = Vec::new();
    while let Some(item) = rx.recv().await {
        paths.push(item.unwrap().path);
    }
    assert_eq!(
        paths,
        vec!["a", "a/1.txt", "a/b", "a/b/2.txt", "a/stale.txt", "m.txt", "zz.txt"]
    );
}

#[tokio::test]
async fn test_sync_into_missing_source_root_fails() {
    let harness = Harness::new();
    harness.dst.seed("x", b"x", mod_time(0));

    let src: Arc<dyn Backend> = harness.src.clone();
    let dst: Arc<dyn Backend> = harness.dst.clone();
    let ctx = EngineContext::new(fast_opts());
    let err = driftsync::sync(&ctx, src, dst, "not/there").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.is_directory());
    assert_eq!(err.exit_code(), 3);
    // Nothing was deleted from the destination.
    assert_eq!(harness.dst.file_paths(), vec!["x"]);
}

#[tokio::test]
async fn test_case_clash_is_conflict_not_action() {
    let harness = Harness::new();
    harness.src.seed("Shared.txt", b"a", mod_time(0));
    harness.src.seed("shared.txt", b"b", mod_time(0));
    let dst = Arc::new(
        MemoryBackend::new("ci-dst").with_caps(|caps| caps.case_insensitive = true),
    );
    let harness = Harness {
        src: harness.src,
        dst,
        opts: harness.opts,
    };

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.errors_by_kind[&ErrorKind::Conflict], 1);
    assert_eq!(summary.exit_code(), 6);
    // Neither colliding file was copied.
    assert!(harness.dst.file_paths().is_empty());
}

#[tokio::test]
async fn test_type_conflict_subtree_is_left_alone() {
    let harness = Harness::new();
    // Source has a file where the destination has a directory of objects.
    harness.src.seed("node", b"file now", mod_time(0));
    harness.dst.seed("node/child.txt", b"keep me", mod_time(0));
    harness.dst.seed_dir("node");

    let (summary, _) = harness.sync().await;

    assert_eq!(summary.errors_by_kind[&ErrorKind::Conflict], 1);
    // The conflicting directory's contents were not deleted.
    assert_eq!(harness.dst.contents("node/child.txt").unwrap(), b"keep me");
}

#[tokio::test]
async fn test_listing_failure_poisons_only_that_subtree() {
    let harness = Harness::new();
    harness.src.seed("ok/a.txt", b"a", mod_time(0));
    harness.src.seed("broken/b.txt", b"b", mod_time(0));
    harness.dst.seed("broken/stale.txt", b"stale", mod_time(0));
    harness.dst.seed_dir("broken");
    harness
        .src
        .inject_fault(
            driftsync::backend::memory::Op::List,
            Some("broken"),
            ErrorKind::PermissionDenied,
            1,
        );

    let (summary, _) = harness.sync().await;

    // The healthy subtree synced.
    assert_eq!(harness.dst.contents("ok/a.txt").unwrap(), b"a");
    // The unreadable subtree produced an error and no deletes.
    assert!(summary.errors >= 1);
    assert_eq!(harness.dst.contents("broken/stale.txt").unwrap(), b"stale");
}
