use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use shard_raft::Config;

#[allow(unused_imports)]
use pretty_assertions::assert_eq;

use fixtures::RaftRouter;

mod fixtures;

/// Cluster restart_replays_persisted_log test.
///
/// What does this test do?
///
/// - brings 3 nodes online and commits a handful of commands.
/// - crashes the whole cluster and restarts every node from its persisted
///   state.
/// - asserts the restarted cluster elects a leader, re-applies the same
///   entries in the same order, and keeps accepting commands.
///
/// RUST_LOG=shard_raft,persistence=debug cargo test -p shard-raft --test persistence
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_replays_persisted_log() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(3, config);
    router.spawn_all().await?;

    router.wait_for_leader(Duration::from_secs(3)).await?;
    for command in 100..105 {
        router.commit_one(command).await?;
    }
    let before = router.applied(0).await;
    assert_eq!(before.len(), 5);

    // Full-cluster crash; persisters survive the handles.
    let mut persisters = Vec::new();
    for id in 0..3 {
        let handle = router.crash_node(id).await?;
        persisters.push((id, handle.persister));
    }

    for (id, persister) in persisters {
        router.spawn_node(id, persister).await?;
    }

    // A restart wipes the applied record; committing one more forces every
    // node to replay the persisted prefix first.
    router.wait_for_leader(Duration::from_secs(3)).await?;
    router.commit_one(500).await?;
    router
        .wait_for_identical_logs(&[0, 1, 2], 6, Duration::from_secs(3))
        .await?;

    let after = router.applied(1).await;
    assert_eq!(&after[..5], &before[..]);
    assert_eq!(after[5], (6, 500));

    Ok(())
}

/// Cluster restart_of_one_follower test.
///
/// What does this test do?
///
/// - commits entries, crashes one follower, commits more entries.
/// - restarts the follower and asserts it catches up to the full log.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_of_one_follower() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = RaftRouter::new(3, config);
    router.spawn_all().await?;

    let leader = router.wait_for_leader(Duration::from_secs(3)).await?;
    for command in 0..5 {
        router.commit_one(command).await?;
    }

    let follower = (0..3).find(|id| *id != leader).unwrap();
    let handle = router.crash_node(follower).await?;

    for command in 5..10 {
        router.commit_one(command).await?;
    }

    router.spawn_node(follower, handle.persister).await?;
    router
        .wait_for_identical_logs(&[0, 1, 2], 10, Duration::from_secs(5))
        .await?;

    let commands: Vec<u64> = router.applied(follower).await.iter().map(|(_, c)| *c).collect();
    assert_eq!(commands, (0..10).collect::<Vec<u64>>());

    Ok(())
}
