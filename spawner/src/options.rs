use std::path::PathBuf;
use std::time::Duration;

/// Value of [`Options::group`] that selects the group owning the startup file.
pub const STARTUP_FILE_GROUP: &str = "!STARTUP_FILE!";

/// Per-spawn input. The spawner never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Directory the application runs in.
    pub app_root: PathBuf,
    /// Free-form application type tag (`rack`, `wsgi`, ...). Informational only.
    pub app_type: String,
    /// argv tokens passed to `exec` verbatim. No shell parsing is performed.
    pub start_command: Vec<String>,
    /// Relative to `app_root`. Its owner drives user/group inference.
    pub startup_file: PathBuf,
    /// Deadline for the whole handshake.
    pub start_timeout: Duration,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Falls back to [`crate::SpawnerConfig::default_user`] when unset.
    pub default_user: Option<String>,
    /// Falls back to [`crate::SpawnerConfig::default_group`] when unset.
    pub default_group: Option<String>,
    /// Appended to the inherited environment in order. Duplicates are kept.
    pub environment_variables: Vec<(String, String)>,
}

impl Options {
    pub fn new(
        app_root: impl Into<PathBuf>,
        start_command: Vec<String>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            app_root: app_root.into(),
            app_type: String::new(),
            start_command,
            startup_file: PathBuf::from("."),
            start_timeout,
            user: None,
            group: None,
            default_user: None,
            default_group: None,
            environment_variables: Vec::new(),
        }
    }

    pub fn startup_file_path(&self) -> PathBuf {
        self.app_root.join(&self.startup_file)
    }
}
