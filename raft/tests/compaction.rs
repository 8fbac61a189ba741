use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use shard_raft::Config;
use shard_raft::Persistence;

#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::RaftRouter;

mod fixtures;

/// Cluster compaction_and_snapshot_catch_up test.
///
/// What does this test do?
///
/// - brings 3 nodes online and commits a batch of commands.
/// - compacts the leader's log at its applied frontier.
/// - isolates one follower, commits and compacts past its log, then heals
///   it.
/// - asserts the follower is caught up via InstallSnapshot (its state is
///   replaced wholesale, not replayed) followed by ordinary AppendEntries.
///
/// RUST_LOG=shard_raft,compaction=debug cargo test -p shard-raft --test compaction
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compaction_and_snapshot_catch_up() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(3, config);
    router.spawn_all().await?;

    router.wait_for_leader(Duration::from_secs(3)).await?;
    for command in 0..10 {
        router.commit_one(command).await?;
    }

    // Compact the leader at its applied frontier.
    let leader = router.leader().await.expect("leader vanished");
    let handle = router.node(leader).await;
    let applied = router.applied(leader).await;
    let boundary = applied.last().unwrap().0;
    let blob = serde_json::to_vec(&applied)?;
    let size_before = handle.persister.raft_state_size().await;
    handle.raft.compact(boundary, blob).await;

    assert!(
        handle.persister.raft_state_size().await < size_before,
        "compaction must shrink the raft state blob"
    );
    handle.raft.wait(None).snapshot(boundary, "leader compacted").await?;

    // Cut one follower off and commit past the snapshot boundary.
    let follower = (0..3).find(|id| *id != leader).unwrap();
    router.isolate_node(follower).await;

    for command in 10..20 {
        router.commit_one(command).await?;
    }
    let leader = router.leader().await.expect("leader vanished");
    let handle = router.node(leader).await;
    let applied = router.applied(leader).await;
    let boundary = applied.last().unwrap().0;
    let blob = serde_json::to_vec(&applied)?;
    handle.raft.compact(boundary, blob).await;
    handle.raft.wait(None).snapshot(boundary, "leader compacted again").await?;

    // Commit a little more so the follower needs AppendEntries after the
    // snapshot lands.
    for command in 20..23 {
        router.commit_one(command).await?;
    }

    // Heal the follower: snapshot first, live entries after.
    router.restore_node(follower).await;
    router
        .wait(follower, Some(Duration::from_secs(5)))
        .await
        .snapshot(boundary, "follower installed snapshot")
        .await?;
    router
        .wait_for_identical_logs(&[0, 1, 2], 23, Duration::from_secs(5))
        .await?;

    let commands: Vec<u64> = router.applied(follower).await.iter().map(|(_, c)| *c).collect();
    assert_eq!(commands, (0..23).collect::<Vec<u64>>());

    Ok(())
}

/// Cluster restart_from_snapshot test.
///
/// What does this test do?
///
/// - commits and compacts, then crashes and restarts a node on its
///   persisted state+snapshot pair.
/// - asserts the restarted node reports the snapshot boundary and rebuilds
///   the identical applied record after catch-up.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_from_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(3, config);
    router.spawn_all().await?;

    router.wait_for_leader(Duration::from_secs(3)).await?;
    for command in 0..8 {
        router.commit_one(command).await?;
    }
    router
        .wait_for_identical_logs(&[0, 1, 2], 8, Duration::from_secs(3))
        .await?;

    // Compact every node so each persists a state+snapshot pair.
    for id in 0..3 {
        let handle = router.node(id).await;
        let applied = router.applied(id).await;
        assert_eq!(applied.len(), 8);
        let boundary = applied.last().unwrap().0;
        handle.raft.compact(boundary, serde_json::to_vec(&applied)?).await;
    }

    let victim = 2;
    let handle = router.crash_node(victim).await?;
    router.spawn_node(victim, handle.persister).await?;

    // The snapshot is the restart point, not index zero.
    let metrics = router.node(victim).await.raft.metrics().borrow().clone();
    assert!(metrics.snapshot_last_index > 0);

    router.commit_one(100).await?;
    router
        .wait_for_identical_logs(&[0, 1, 2], 9, Duration::from_secs(5))
        .await?;
    let commands: Vec<u64> = router.applied(victim).await.iter().map(|(_, c)| *c).collect();
    assert_eq!(commands, vec![0, 1, 2, 3, 4, 5, 6, 7, 100]);

    Ok(())
}
