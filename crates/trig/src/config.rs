//! Configuration file handling.
//!
//! Looks for `.config/trig.styx` in a directory or any of its parents. No
//! file at all means defaults everywhere.

pub use trig_config::Config;

use camino::{Utf8Path, Utf8PathBuf};

use crate::migrate::DirectorySource;
use crate::{Action, Actor, Caller, Error, Gate, KillSwitch, PermissionChecker, Result};

const CONFIG_FILE: &str = ".config/trig.styx";

/// A loaded configuration and where it came from.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub config: Config,
    /// Path of the config file, if one was found.
    pub path: Option<Utf8PathBuf>,
}

impl Settings {
    /// The directory relative paths in the config are resolved against: the
    /// parent of `.config/`. `None` when no file was found.
    pub fn root(&self) -> Option<&Utf8Path> {
        self.path.as_deref()?.parent()?.parent()
    }

    /// The migrations directory, resolved against [`Self::root`].
    pub fn migrations_dir(&self) -> Utf8PathBuf {
        let dir = Utf8Path::new(self.config.migrations_dir());
        match self.root() {
            Some(root) if dir.is_relative() => root.join(dir),
            _ => dir.to_path_buf(),
        }
    }

    pub fn migration_source(&self) -> DirectorySource {
        DirectorySource::new(self.migrations_dir())
    }

    pub fn kill_switch(&self) -> Result<KillSwitch> {
        kill_switch(&self.config)
    }

    /// A caller for `actor`, in the configured default environment if any.
    pub fn caller(&self, actor: Actor) -> Caller {
        let caller = Caller::new(actor);
        match self.config.default_environment() {
            Some(env) => caller.environment(env),
            None => caller,
        }
    }

    /// A gate backed by `checker` with the configured kill switch.
    pub fn gate(&self, checker: impl PermissionChecker + 'static) -> Result<Gate> {
        Ok(Gate::new(checker).with_kill_switch(self.kill_switch()?))
    }
}

/// Load configuration, searching up from the current directory.
pub fn load() -> Result<Settings> {
    let cwd = std::env::current_dir().map_err(|e| Error::Io {
        path: ".".into(),
        source: e,
    })?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| Error::Config(format!("current directory is not UTF-8: {}", p.display())))?;
    load_from(&cwd)
}

/// Load configuration, searching up from `start`.
pub fn load_from(start: &Utf8Path) -> Result<Settings> {
    let Some(path) = find_config_file(start) else {
        tracing::debug!(start = %start, "no {} found, using defaults", CONFIG_FILE);
        return Ok(Settings::default());
    };

    let content = std::fs::read_to_string(&path).map_err(|e| Error::Io {
        path: path.to_string(),
        source: e,
    })?;
    let config = parse(&content).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {}", path, msg)),
        other => other,
    })?;

    // Surface bad action names at load time rather than on first use.
    kill_switch(&config)?;

    tracing::debug!(path = %path, "loaded configuration");
    Ok(Settings {
        config,
        path: Some(path),
    })
}

/// Parse the contents of a config file.
pub fn parse(content: &str) -> Result<Config> {
    facet_styx::from_str(content).map_err(|e| Error::Config(e.to_string()))
}

fn find_config_file(start: &Utf8Path) -> Option<Utf8PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|path| path.is_file())
}

/// Build the kill switch a config describes.
pub fn kill_switch(config: &Config) -> Result<KillSwitch> {
    let actions = config
        .kill_switch_actions()
        .iter()
        .map(|name| name.parse::<Action>())
        .collect::<Result<Vec<_>>>()?;
    Ok(KillSwitch {
        enabled: config.kill_switch_enabled(),
        environments: config.kill_switch_environments().to_vec(),
        actions,
    })
}
