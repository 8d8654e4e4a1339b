use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Annotation key under which the child's prepared environment is recorded.
pub const ENVVARS_ANNOTATION: &str = "envvars";

/// Classifies why an application failed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The handshake did not finish before `start_timeout` elapsed.
    AppStartupTimeout,
    /// The application wrote something that is not part of the handshake grammar.
    AppStartupProtocolError,
    /// The application reported its own failure together with an error page.
    AppStartupExplainableError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AppStartupTimeout => "APP_STARTUP_TIMEOUT",
            ErrorKind::AppStartupProtocolError => "APP_STARTUP_PROTOCOL_ERROR",
            ErrorKind::AppStartupExplainableError => "APP_STARTUP_EXPLAINABLE_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An application process failed during startup.
#[derive(Debug, Clone, Error)]
#[error("{message} ({kind})")]
pub struct SpawnError {
    kind: ErrorKind,
    message: String,
    error_page: Option<String>,
    annotations: BTreeMap<String, String>,
}

impl SpawnError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_page: None,
            annotations: BTreeMap::new(),
        }
    }

    pub(crate) fn timeout(start_timeout_ms: u128) -> Self {
        Self::new(
            ErrorKind::AppStartupTimeout,
            format!("the application did not finish starting within {start_timeout_ms} ms"),
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AppStartupProtocolError, message)
    }

    pub(crate) fn explainable(message: impl Into<String>, error_page: impl Into<String>) -> Self {
        Self::new(ErrorKind::AppStartupExplainableError, message).with_error_page(error_page)
    }

    pub fn with_error_page(mut self, error_page: impl Into<String>) -> Self {
        self.error_page = Some(error_page.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The page the application printed after announcing `Error`, if any.
    pub fn error_page(&self) -> Option<&str> {
        self.error_page.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }
}

impl std::ops::Index<&str> for SpawnError {
    type Output = str;

    /// Missing keys read as the empty string.
    fn index(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }
}

/// The spawner itself is misconfigured; the application was never started.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Cannot determine a user to lower privilege to")]
    UnresolvableUser,
    #[error("Cannot determine a group to lower privilege to")]
    UnresolvableGroup,
    #[error("the start command is empty")]
    EmptyStartCommand,
    #[error("failed to query the account database: {source}")]
    AccountLookup {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read spawner config {path:?}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse spawner config: {source}")]
    ParseConfig {
        #[source]
        source: toml::de::Error,
    },
}

/// Every failure of [`crate::Spawner::spawn`] is exactly one of these.
#[derive(Debug, Error)]
pub enum SpawnerError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

impl SpawnerError {
    pub fn as_spawn_error(&self) -> Option<&SpawnError> {
        match self {
            SpawnerError::Spawn(err) => Some(err),
            SpawnerError::Configuration(_) => None,
        }
    }

    pub fn as_configuration_error(&self) -> Option<&ConfigurationError> {
        match self {
            SpawnerError::Spawn(_) => None,
            SpawnerError::Configuration(err) => Some(err),
        }
    }
}
