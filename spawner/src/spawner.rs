use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::time::Instant;

use crate::access::check_app_root_access;
use crate::accounts::AccountDatabase;
use crate::accounts::SystemAccounts;
use crate::config::SpawnerConfig;
use crate::error::ConfigurationError;
use crate::error::ENVVARS_ANNOTATION;
use crate::error::SpawnError;
use crate::error::SpawnerError;
use crate::handshake::HandshakeOutcome;
use crate::handshake::read_handshake;
use crate::launcher::LaunchRequest;
use crate::launcher::LaunchedProcess;
use crate::launcher::generate_connect_password;
use crate::launcher::launch;
use crate::launcher::prepare_environment;
use crate::options::Options;
use crate::pool::SocketEndpoint;
use crate::privilege::PrivilegeResolver;
use crate::privilege::ResolvedIdentity;
use crate::process::ProcessHandle;
use crate::process_group::kill_and_reap;

/// Starts application processes. Cheap to share; concurrent `spawn` calls
/// share no mutable state.
pub struct Spawner {
    config: SpawnerConfig,
    accounts: Arc<dyn AccountDatabase>,
    stdout_target: Option<OwnedFd>,
    stderr_target: Option<Arc<OwnedFd>>,
}

impl Spawner {
    pub fn new(config: SpawnerConfig) -> Self {
        Self {
            config,
            accounts: Arc::new(SystemAccounts),
            stdout_target: None,
            stderr_target: None,
        }
    }

    pub fn with_accounts(mut self, accounts: Arc<dyn AccountDatabase>) -> Self {
        self.accounts = accounts;
        self
    }

    /// Children get a duplicate of `target` as their stdout instead of
    /// inheriting the spawner's.
    pub fn with_stdout(mut self, target: OwnedFd) -> Self {
        self.stdout_target = Some(target);
        self
    }

    /// Children get a duplicate of `target` as their stderr instead of
    /// inheriting the spawner's.
    pub fn with_stderr(mut self, target: OwnedFd) -> Self {
        self.stderr_target = Some(Arc::new(target));
        self
    }

    pub fn config(&self) -> &SpawnerConfig {
        &self.config
    }

    /// Launches `options.start_command` and waits for its handshake, for at
    /// most `options.start_timeout` measured from the fork.
    pub async fn spawn(&self, options: &Options) -> Result<ProcessHandle, SpawnerError> {
        let result = self.spawn_inner(options).await;
        if let Err(err) = &result {
            tracing::warn!("failed to spawn {:?}: {err}", options.app_root);
        }
        result
    }

    async fn spawn_inner(&self, options: &Options) -> Result<ProcessHandle, SpawnerError> {
        if options.start_command.is_empty() {
            return Err(ConfigurationError::EmptyStartCommand.into());
        }
        let (identity, switching) = self.target_identity(options)?;

        let connect_password = generate_connect_password();
        let environment = prepare_environment(options, &connect_password);
        let envvars = environment.snapshot();
        let annotate = |err: SpawnError| err.with_annotation(ENVVARS_ANNOTATION, envvars.clone());

        match check_app_root_access(&options.app_root, &identity) {
            Ok(Ok(())) => {}
            Ok(Err(problem)) => {
                return Err(annotate(SpawnError::explainable(
                    "the application root is not accessible",
                    problem.error_page(&identity),
                ))
                .into());
            }
            Err(err) => {
                return Err(annotate(SpawnError::explainable(
                    "the application root cannot be resolved",
                    format!(
                        "The application root directory '{}' cannot be resolved: {err}\n",
                        options.app_root.display()
                    ),
                ))
                .into());
            }
        }

        let LaunchedProcess {
            mut child,
            control_channel,
        } = launch(LaunchRequest {
            options,
            switch_to: switching.then_some(&identity),
            environment: &environment,
            stdout: self.stdout_target.as_ref(),
            stderr: self.stderr_target.as_deref(),
        })
        .map_err(|err| {
            annotate(SpawnError::explainable(
                "the application could not be started",
                format!(
                    "The application process could not be started with the command {:?}: {err}\n",
                    options.start_command
                ),
            ))
        })?;
        let deadline = Instant::now() + options.start_timeout;

        let Some(pid) = child.id() else {
            kill_and_reap(&mut child, self.config.reap_timeout()).await;
            return Err(annotate(SpawnError::protocol(
                "the application process exited before it could be tracked",
            ))
            .into());
        };
        tracing::debug!("started process {pid}, waiting for its handshake");

        let mut control_channel = BufReader::new(control_channel);
        let outcome = read_handshake(&mut control_channel, deadline).await;
        drop(control_channel);
        let error = match outcome {
            HandshakeOutcome::Ready(announcements) => {
                let sockets: Vec<SocketEndpoint> = announcements
                    .into_iter()
                    .map(|announcement| {
                        SocketEndpoint::new(announcement, self.config.max_connections_per_endpoint)
                    })
                    .collect();
                tracing::info!(
                    "spawned process {pid} in {:?} with {} socket(s)",
                    options.app_root,
                    sockets.len()
                );
                return Ok(ProcessHandle::new(
                    pid,
                    child,
                    sockets,
                    connect_password,
                    self.stderr_target.clone(),
                ));
            }
            HandshakeOutcome::ExplainableError { page, attributes } => {
                let mut error =
                    SpawnError::explainable("the application reported a startup error", page);
                for (key, value) in attributes {
                    error = error.with_annotation(key, value);
                }
                error
            }
            HandshakeOutcome::ProtocolError(message) => SpawnError::protocol(message),
            HandshakeOutcome::Timeout => SpawnError::timeout(options.start_timeout.as_millis()),
        };

        kill_and_reap(&mut child, self.config.reap_timeout()).await;
        Err(annotate(error).into())
    }

    /// Lowers privileges only when enabled and running as root; otherwise the
    /// child keeps the spawner's own identity.
    fn target_identity(
        &self,
        options: &Options,
    ) -> Result<(ResolvedIdentity, bool), ConfigurationError> {
        if self.config.user_switching && unsafe { libc::geteuid() } == 0 {
            let resolver = PrivilegeResolver::new(
                Arc::clone(&self.accounts),
                self.config.default_user.clone(),
                self.config.default_group.clone(),
            );
            let identity = resolver.resolve(options)?;
            tracing::debug!(
                "lowering privileges to {}({}):{}({})",
                identity.user_name,
                identity.uid,
                identity.group_name,
                identity.primary_gid
            );
            return Ok((identity, true));
        }
        let identity = ResolvedIdentity::current(self.accounts.as_ref())
            .map_err(|source| ConfigurationError::AccountLookup { source })?;
        Ok((identity, false))
    }
}
