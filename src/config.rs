// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment configuration.
//!
//! A deployment is described by a flat TOML file of named settings. Four
//! settings are required: the local directory to upload, the remote user, the
//! remote host, and the remote base directory that holds every release.
//!
//! ```toml
//! local_dir = "~/site/public"
//! remote_user = "deploy"
//! remote_host = "www.example.org"
//! remote_base_dir = "/var/www/site"
//!
//! # Optional.
//! keep_releases = 5
//! remote_port = 22
//! ```
//!
//! The file is read and parsed once. Settings are looked up lazily: a missing
//! required setting is only reported when something asks for it, so nothing
//! is validated up front beyond TOML syntax.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};
use toml::{Table, Value};
use tracing::{debug, instrument};

/// Number of releases kept on the remote host when `keep_releases` is unset.
pub const DEFAULT_KEEP_RELEASES: usize = 5;

const KEEP_RELEASES_KEY: &str = "keep_releases";
const REMOTE_PORT_KEY: &str = "remote_port";

/// Required deployment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Setting {
    /// Local directory whose top-level entries get uploaded.
    LocalDir,

    /// User to log into the remote host as.
    RemoteUser,

    /// Remote host to deploy to.
    RemoteHost,

    /// Remote directory holding every release and the `current` link.
    RemoteBaseDir,
}

impl Setting {
    /// Every required setting.
    pub const ALL: [Setting; 4] = [
        Setting::LocalDir,
        Setting::RemoteUser,
        Setting::RemoteHost,
        Setting::RemoteBaseDir,
    ];

    /// Key naming this setting in the configuration file.
    pub fn key(&self) -> &'static str {
        match self {
            Self::LocalDir => "local_dir",
            Self::RemoteUser => "remote_user",
            Self::RemoteHost => "remote_host",
            Self::RemoteBaseDir => "remote_base_dir",
        }
    }
}

impl Display for Setting {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.key())
    }
}

/// Loaded deployment configuration.
///
/// Immutable once loaded. Lookups go through [`Config::get`] and the typed
/// accessors for optional settings, never through open-ended key access.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    table: Table,
}

impl Config {
    /// Read and parse configuration file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if the file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if the file is not valid TOML.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        debug!("load configuration from {:?}", path.as_ref().display());
        let data = read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            source,
            path: path.as_ref().to_path_buf(),
        })?;

        data.parse()
    }

    /// Look up required setting.
    ///
    /// Scalar values are handed back in their textual form. No checks are
    /// made on what the value looks like.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingKey`] if the setting is absent.
    /// - Return [`ConfigError::InvalidValue`] if the setting holds an array or
    ///   table.
    pub fn get(&self, setting: Setting) -> Result<&str> {
        let value = self
            .table
            .get(setting.key())
            .ok_or(ConfigError::MissingKey(setting))?;

        match value {
            Value::String(string) => Ok(string.as_str()),
            _ => Err(ConfigError::InvalidValue {
                key: setting.key(),
                reason: format!("expected a string, found {}", value.type_str()),
            }),
        }
    }

    /// Local directory to upload, with shell expansion applied.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::MissingKey`] if `local_dir` is absent.
    /// - Return [`ConfigError::ShellExpansion`] if expansion fails.
    pub fn local_dir(&self) -> Result<PathBuf> {
        let raw = self.get(Setting::LocalDir)?;
        Ok(PathBuf::from(shellexpand::full(raw)?.into_owned()))
    }

    /// Number of releases to keep after cleanup.
    ///
    /// Defaults to [`DEFAULT_KEEP_RELEASES`].
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidValue`] if not a positive integer.
    pub fn keep_releases(&self) -> Result<usize> {
        let Some(value) = self.table.get(KEEP_RELEASES_KEY) else {
            return Ok(DEFAULT_KEEP_RELEASES);
        };

        match value {
            Value::Integer(count) if *count > 0 => {
                usize::try_from(*count).map_err(|_| ConfigError::InvalidValue {
                    key: KEEP_RELEASES_KEY,
                    reason: format!("{count} is out of range"),
                })
            }
            Value::Integer(count) => Err(ConfigError::InvalidValue {
                key: KEEP_RELEASES_KEY,
                reason: format!("must keep at least one release, got {count}"),
            }),
            _ => Err(ConfigError::InvalidValue {
                key: KEEP_RELEASES_KEY,
                reason: format!("expected an integer, found {}", value.type_str()),
            }),
        }
    }

    /// SSH port of remote host, if one is configured.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::InvalidValue`] if not an integer in `1..=65535`.
    pub fn remote_port(&self) -> Result<Option<u16>> {
        let Some(value) = self.table.get(REMOTE_PORT_KEY) else {
            return Ok(None);
        };

        match value {
            Value::Integer(port) => match u16::try_from(*port) {
                Ok(port) if port != 0 => Ok(Some(port)),
                _ => Err(ConfigError::InvalidValue {
                    key: REMOTE_PORT_KEY,
                    reason: format!("{port} is not a valid port"),
                }),
            },
            _ => Err(ConfigError::InvalidValue {
                key: REMOTE_PORT_KEY,
                reason: format!("expected an integer, found {}", value.type_str()),
            }),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut table: Table = toml::de::from_str(data)?;

        // INVARIANT: Required settings are handed out as strings, so scalars
        //   like `remote_host = 10` are stored in their textual form.
        for setting in Setting::ALL {
            if let Some(value) = table.get_mut(setting.key()) {
                let text = match value {
                    Value::Integer(integer) => Some(integer.to_string()),
                    Value::Float(float) => Some(float.to_string()),
                    Value::Boolean(boolean) => Some(boolean.to_string()),
                    Value::Datetime(datetime) => Some(datetime.to_string()),
                    _ => None,
                };

                if let Some(text) = text {
                    *value = Value::String(text);
                }
            }
        }

        Ok(Self { table })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file cannot be read.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Required setting is absent.
    #[error("missing configuration key `{0}`")]
    MissingKey(Setting),

    /// Setting holds a value that cannot be used.
    #[error("invalid value for configuration key {key:?}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
