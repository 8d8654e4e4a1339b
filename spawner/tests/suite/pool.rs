use std::sync::Arc;
use std::time::Duration;

use apppool_spawner::Spawner;
use apppool_spawner::SpawnerConfig;
use pretty_assertions::assert_eq;

use super::harness::KillOnDrop;
use super::harness::command;
use super::harness::stub_options;
use super::harness::test_config;

fn spawner_with_capacity(max_connections_per_endpoint: usize) -> Spawner {
    Spawner::new(SpawnerConfig {
        max_connections_per_endpoint,
        ..test_config()
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_hold_connections_exclusively_up_to_capacity() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let process = spawner_with_capacity(2)
        .spawn(&stub_options(app_root.path(), sockets.path()))
        .await?;
    let _guard = KillOnDrop(process.pid());
    let Some(endpoint) = process.default_socket() else {
        anyhow::bail!("no default socket");
    };
    let pool = Arc::clone(endpoint.pool());

    let mut first = process.new_session().await?;
    first.initiate().await?;
    let mut second = process.new_session().await?;
    second.initiate().await?;
    assert_ne!(first.fd(), second.fd());
    assert_eq!(pool.checked_out_count(), 2);
    assert!(pool.try_checkout().is_none());

    let waiter = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.checkout().await.slot() }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // Finishing a request consumes the connection; its slot is freed.
    first.write_all(b"ping\n").await?;
    assert_eq!(first.read_response().await?, b"pong\n".to_vec());
    drop(first);
    tokio::time::timeout(Duration::from_secs(5), waiter).await??;

    drop(second);
    assert_eq!(pool.checked_out_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_never_exceed_capacity() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let process = Arc::new(
        spawner_with_capacity(2)
            .spawn(&stub_options(app_root.path(), sockets.path()))
            .await?,
    );
    let _guard = KillOnDrop(process.pid());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let process = Arc::clone(&process);
        tasks.push(tokio::spawn(async move {
            let reply = command(&process, "ping\n").await?;
            let Some(endpoint) = process.default_socket() else {
                anyhow::bail!("no default socket");
            };
            let in_use = endpoint.pool().checked_out_count();
            anyhow::Ok((reply, in_use))
        }));
    }
    for task in tasks {
        let (reply, in_use) = task.await??;
        assert_eq!(reply, "pong\n");
        assert!(in_use <= 2, "{in_use} connections checked out at once");
    }

    let Some(endpoint) = process.default_socket() else {
        anyhow::bail!("no default socket");
    };
    assert_eq!(endpoint.pool().checked_out_count(), 0);
    assert_eq!(endpoint.pool().idle_count(), 0);
    Ok(())
}
