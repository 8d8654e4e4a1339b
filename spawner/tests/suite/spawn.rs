use apppool_spawner::request::CONNECT_PASSWORD_KEY;
use pretty_assertions::assert_eq;

use super::harness::KillOnDrop;
use super::harness::command;
use super::harness::spawner;
use super::harness::stub_options;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_round_trip_over_the_default_socket() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let process = spawner()
        .spawn(&stub_options(app_root.path(), sockets.path()))
        .await?;
    let _guard = KillOnDrop(process.pid());

    assert_eq!(process.sockets().len(), 1);
    let Some(endpoint) = process.default_socket() else {
        anyhow::bail!("no default socket");
    };
    assert_eq!(endpoint.name(), "main");
    assert_eq!(endpoint.protocol(), "session");
    assert_eq!(endpoint.concurrency(), 1);

    assert_eq!(command(&process, "ping\n").await?, "pong\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reported_pid_matches_the_application() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let process = spawner()
        .spawn(&stub_options(app_root.path(), sockets.path()))
        .await?;
    let _guard = KillOnDrop(process.pid());

    assert_eq!(
        command(&process, "pid\n").await?,
        format!("{}\n", process.pid())
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn environment_variables_reach_the_application() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let mut options = stub_options(app_root.path(), sockets.path());
    options.environment_variables = vec![
        ("PASSENGER_FOO".to_string(), "foo".to_string()),
        ("PASSENGER_BAR".to_string(), "bar".to_string()),
    ];
    let process = spawner().spawn(&options).await?;
    let _guard = KillOnDrop(process.pid());

    let envvars = command(&process, "envvars\n").await?;
    assert!(envvars.contains("PASSENGER_FOO = foo\n"), "{envvars}");
    assert!(envvars.contains("PASSENGER_BAR = bar\n"), "{envvars}");
    assert!(envvars.contains(&format!(
        "{CONNECT_PASSWORD_KEY} = {}\n",
        process.connect_password()
    )));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn application_keeps_the_spawner_identity_without_switching() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let process = spawner()
        .spawn(&stub_options(app_root.path(), sockets.path()))
        .await?;
    let _guard = KillOnDrop(process.pid());

    let identity = command(&process, "identity\n").await?;
    let mut lines = identity.lines();
    assert_eq!(lines.next(), Some(unsafe { libc::getuid() }.to_string().as_str()));
    assert_eq!(lines.next(), Some(unsafe { libc::getgid() }.to_string().as_str()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_process_gets_its_own_connect_password() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let spawner = spawner();
    let options = stub_options(app_root.path(), sockets.path());

    let (first, second) = tokio::join!(spawner.spawn(&options), spawner.spawn(&options));
    let (first, second) = (first?, second?);
    let _guards = (KillOnDrop(first.pid()), KillOnDrop(second.pid()));

    assert_ne!(first.pid(), second.pid());
    assert_ne!(first.connect_password(), second.connect_password());
    assert_eq!(command(&second, "ping\n").await?, "pong\n");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_can_target_a_named_socket() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let sockets = tempfile::tempdir()?;
    let mut options = stub_options(app_root.path(), sockets.path());
    options
        .start_command
        .extend(["--name".to_string(), "http".to_string()]);
    let process = spawner().spawn(&options).await?;
    let _guard = KillOnDrop(process.pid());

    let mut session = process.new_session_on("http").await?;
    session.initiate().await?;
    assert!(session.fd().is_some());
    session.write_all(b"ping\n").await?;
    assert_eq!(session.read_response().await?, b"pong\n".to_vec());

    assert!(process.new_session_on("missing").await.is_err());
    Ok(())
}
