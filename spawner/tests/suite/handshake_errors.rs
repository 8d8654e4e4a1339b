use std::time::Duration;
use std::time::Instant;

use apppool_spawner::ConfigurationError;
use apppool_spawner::ENVVARS_ANNOTATION;
use apppool_spawner::ErrorKind;
use apppool_spawner::Options;
use apppool_spawner::SpawnError;
use pretty_assertions::assert_eq;

use super::harness::shell_options;
use super::harness::spawner;

async fn expect_spawn_error(options: &Options) -> anyhow::Result<SpawnError> {
    match spawner().spawn(options).await {
        Ok(process) => anyhow::bail!("spawn unexpectedly succeeded with pid {}", process.pid()),
        Err(err) => match err.as_spawn_error() {
            Some(spawn_error) => Ok(spawn_error.clone()),
            None => anyhow::bail!("expected a spawn error, got {err}"),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_timeout_is_enforced() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(app_root.path(), "sleep 60", Duration::from_millis(300));

    let started = Instant::now();
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupTimeout);
    assert_eq!(err.error_page(), None);
    assert!(started.elapsed() < Duration::from_secs(10));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_process_group_is_killed() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let pid_file = app_root.path().join("pid");
    let script = format!("echo $$ > '{}'; sleep 60", pid_file.display());
    let options = shell_options(app_root.path(), &script, Duration::from_millis(500));

    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupTimeout);

    let pid: libc::pid_t = std::fs::read_to_string(&pid_file)?.trim().parse()?;
    // The spawner reaped its own child, so the pid no longer exists.
    assert_eq!(unsafe { libc::kill(pid, 0) }, -1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrecognized_directive_is_a_protocol_error() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(
        app_root.path(),
        "echo '!> hello world' >&3",
        Duration::from_secs(10),
    );
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupProtocolError);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exiting_without_a_handshake_is_a_protocol_error() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(app_root.path(), "exit 0", Duration::from_secs(10));
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupProtocolError);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_directive_yields_the_page_verbatim() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(
        app_root.path(),
        r#"{ echo '!> Error'; printf '%s\n' "He's dead, Jim!" "Relax, I'm a doctor."; } >&3"#,
        Duration::from_secs(10),
    );
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupExplainableError);
    assert_eq!(
        err.error_page(),
        Some("He's dead, Jim!\nRelax, I'm a doctor.\n")
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_attributes_become_annotations() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(
        app_root.path(),
        "printf '!> Error\\n!> html: true\\n!>\\n<p>broken</p>\\n' >&3",
        Duration::from_secs(10),
    );
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupExplainableError);
    assert_eq!(err.error_page(), Some("<p>broken</p>\n"));
    assert_eq!(&err["html"], "true");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timeout_wins_over_an_unfinished_error_page() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = shell_options(
        app_root.path(),
        "{ echo '!> Error'; echo 'He is dead'; } >&3; sleep 60",
        Duration::from_millis(500),
    );
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupTimeout);
    assert_eq!(err.error_page(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failures_record_the_prepared_environment() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let mut options = shell_options(
        app_root.path(),
        "echo '!> hello world' >&3",
        Duration::from_secs(10),
    );
    options.environment_variables = vec![("PASSENGER_FOO".to_string(), "foo".to_string())];
    let err = expect_spawn_error(&options).await?;
    assert!(err[ENVVARS_ANNOTATION].contains("PASSENGER_FOO=foo\n"));
    assert!(!err[ENVVARS_ANNOTATION].contains("PASSENGER_CONNECT_PASSWORD"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexecutable_command_is_an_explainable_error() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = Options::new(
        app_root.path(),
        vec![app_root.path().join("no-such-program").display().to_string()],
        Duration::from_secs(10),
    );
    let err = expect_spawn_error(&options).await?;
    assert_eq!(err.kind(), ErrorKind::AppStartupExplainableError);
    assert!(
        err.error_page()
            .is_some_and(|page| page.contains("could not be started"))
    );
    Ok(())
}

#[tokio::test]
async fn empty_start_command_is_a_configuration_error() -> anyhow::Result<()> {
    let app_root = tempfile::tempdir()?;
    let options = Options::new(app_root.path(), Vec::new(), Duration::from_secs(1));
    let Err(err) = spawner().spawn(&options).await else {
        anyhow::bail!("spawn with an empty command succeeded");
    };
    assert!(matches!(
        err.as_configuration_error(),
        Some(ConfigurationError::EmptyStartCommand)
    ));
    Ok(())
}
