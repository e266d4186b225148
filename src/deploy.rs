// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release deployment.
//!
//! A deployment copies the top-level entries of a local directory into a new
//! release directory on the remote host, points the `current` link of the
//! remote base directory at it, and deletes releases that fell out of the
//! retention window.
//!
//! # Remote Layout
//!
//! ```text
//! <remote_base_dir>/
//!     20240101120000/
//!     20240102093011/
//!     current -> <remote_base_dir>/20240102093011
//! ```
//!
//! # Activation
//!
//! The `current` link is never removed and recreated. A new link is staged
//! under a hidden name first, and then renamed over `current`, so observers
//! always see either the old release or the new one.
//!
//! # Failure
//!
//! Each step aborts the deployment on failure, and completed steps are not
//! undone. A failed upload leaves an incomplete release directory behind that
//! `current` never points to. A failed cleanup leaves extra releases around
//! for the next deployment to remove, while the new release stays active.

use crate::{
    config::{Config, ConfigError, Setting},
    path::{top_level_entries, LocalDirError, LocalDirGuard},
    release::{Clock, ReleaseId, ReleaseSet, SystemClock},
    remote::{within, OpenSsh, RemoteCommand, RemoteError, Session, SessionGuard, Target, Transport},
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Name of the link designating the live release.
pub const ACTIVATION_LINK: &str = "current";

/// Progress of a single deployment.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    #[default]
    NotStarted,
    DirectoryChanged,
    SessionOpen,
    ReleaseDirCreated,
    FilesUploaded,
    Activated,
    Cleaned,
    Done,
    Failed,
}

/// Step of a deployment that talks to the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    CreateReleaseDir,
    Upload,
    Activate,
    Cleanup,
}

impl Display for Stage {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Connect => "connect to remote host",
            Self::CreateReleaseDir => "create release directory",
            Self::Upload => "upload files",
            Self::Activate => "activate release",
            Self::Cleanup => "clean old releases",
        })
    }
}

/// Outcome of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// Release that is now live.
    pub release: ReleaseId,

    /// Remote directory of the live release.
    pub release_path: PathBuf,

    /// Top-level local entries that were uploaded.
    pub uploaded: Vec<PathBuf>,

    /// Old releases that were removed.
    pub pruned: Vec<String>,
}

/// Deploys releases according to a configuration.
///
/// Generic over the transport used to reach the remote host, and the clock
/// used to name releases.
#[derive(Debug)]
pub struct Deployer<T = OpenSsh, C = SystemClock>
where
    T: Transport,
    C: Clock,
{
    config: Config,
    transport: T,
    clock: C,
    state: DeployState,
}

impl Deployer {
    /// Construct deployer over OpenSSH using local time.
    pub fn new(config: Config) -> Self {
        Self::with_transport(config, OpenSsh::new(), SystemClock)
    }
}

impl<T, C> Deployer<T, C>
where
    T: Transport,
    C: Clock,
{
    /// Construct deployer with given transport and clock.
    pub fn with_transport(config: Config, transport: T, clock: C) -> Self {
        Self {
            config,
            transport,
            clock,
            state: DeployState::NotStarted,
        }
    }

    /// Last state reached by the latest deployment.
    pub fn state(&self) -> DeployState {
        self.state
    }

    /// Deploy local directory as a new release.
    ///
    /// Settings are all resolved before anything else happens, so a bad
    /// configuration never reaches the local directory or the remote host.
    /// The working directory of the process is switched to the local
    /// directory for the duration of the call.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::Config`] if a setting is missing or unusable.
    /// - Return [`DeployError::LocalDir`] if the local directory cannot be
    ///   entered or listed.
    /// - Return [`DeployError::Remote`] if a remote command or transfer fails.
    #[instrument(skip(self), level = "debug")]
    pub fn deploy(&mut self) -> Result<DeployReport> {
        self.state = DeployState::NotStarted;
        let result = self.run();
        if result.is_err() {
            self.advance(DeployState::Failed);
        }

        result
    }

    fn run(&mut self) -> Result<DeployReport> {
        let plan = Plan::resolve(&self.config)?;

        let _local = LocalDirGuard::enter(&plan.local_dir)?;
        self.advance(DeployState::DirectoryChanged);

        info!("connect to {}", plan.target);
        let session = self
            .transport
            .connect(&plan.target)
            .map_err(at(Stage::Connect))?;
        let mut session = SessionGuard::new(session);
        self.advance(DeployState::SessionOpen);

        let release = ReleaseId::from_time(self.clock.now());
        let release_path = plan.base_dir.join(release.as_str());

        info!("create release directory {:?}", release_path.display());
        session
            .execute(&RemoteCommand::new("mkdir").arg("-p").path_arg(&release_path))
            .map_err(at(Stage::CreateReleaseDir))?;
        self.advance(DeployState::ReleaseDirCreated);

        let uploaded = upload_entries(&mut *session, &release_path)?;
        self.advance(DeployState::FilesUploaded);

        let mut base = within(&mut *session, &plan.base_dir);
        activate_release(&mut *base, &plan.base_dir, &release).map_err(at(Stage::Activate))?;
        self.advance(DeployState::Activated);

        let pruned = clean_old_releases(&mut *base, &plan.base_dir, plan.keep, &release)
            .map_err(at(Stage::Cleanup))?;
        drop(base);
        self.advance(DeployState::Cleaned);

        info!("release {release} is live");
        self.advance(DeployState::Done);

        Ok(DeployReport {
            release,
            release_path,
            uploaded,
            pruned,
        })
    }

    fn advance(&mut self, state: DeployState) {
        debug!("deployment state {:?} -> {state:?}", self.state);
        self.state = state;
    }
}

/// Settings one deployment runs with.
#[derive(Debug)]
struct Plan {
    local_dir: PathBuf,
    target: Target,
    base_dir: PathBuf,
    keep: usize,
}

impl Plan {
    fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let local_dir = config.local_dir()?;
        let target = Target::new(
            config.get(Setting::RemoteUser)?,
            config.get(Setting::RemoteHost)?,
        )
        .with_port(config.remote_port()?);
        let base_dir = PathBuf::from(config.get(Setting::RemoteBaseDir)?);
        let keep = config.keep_releases()?;

        Ok(Self {
            local_dir,
            target,
            base_dir,
            keep,
        })
    }
}

/// Upload top-level entries of working directory into release directory.
///
/// Entries go over one at a time, each copied recursively under its own name.
/// The first failed transfer aborts the upload.
fn upload_entries<S: Session + ?Sized>(
    session: &mut S,
    release_path: &Path,
) -> Result<Vec<PathBuf>> {
    let entries = top_level_entries()?;
    if entries.is_empty() {
        warn!("local directory has nothing to upload");
    }

    for entry in &entries {
        info!("upload {:?}", entry.display());
        session
            .upload(entry, &release_path.join(entry), true)
            .map_err(at(Stage::Upload))?;
    }

    Ok(entries)
}

/// Point activation link of base directory at release.
///
/// Stages the new link under a hidden name and renames it over the existing
/// link in one step. If the rename fails, the staged link is removed again on
/// a best effort basis and the rename failure is returned.
pub fn activate_release<S: Session + ?Sized>(
    session: &mut S,
    base_dir: &Path,
    release: &ReleaseId,
) -> Result<(), RemoteError> {
    let staged = base_dir.join(format!(".{ACTIVATION_LINK}.{release}"));
    info!("activate release {release}");

    session.execute(
        &RemoteCommand::new("ln")
            .args(["-s", "-f", "-n"])
            .path_arg(base_dir.join(release.as_str()))
            .path_arg(&staged),
    )?;
    let renamed = session.execute(
        &RemoteCommand::new("mv")
            .args(["-T", "-f"])
            .path_arg(&staged)
            .path_arg(base_dir.join(ACTIVATION_LINK)),
    );

    if renamed.is_err() {
        let discard = RemoteCommand::new("rm").arg("-f").path_arg(&staged);
        if let Err(error) = session.execute(&discard) {
            warn!("failed to remove staged link {:?}: {error}", staged.display());
        }
    }

    renamed
}

/// Remove releases beyond the newest `keep` in base directory.
///
/// Expects the session to be scoped to the base directory. Releases are
/// removed oldest first, and `current` release is always spared. Every
/// removal is attempted even if an earlier one failed, in which case the
/// first failure is returned once all attempts are done.
pub fn clean_old_releases<S: Session + ?Sized>(
    session: &mut S,
    base_dir: &Path,
    keep: usize,
    current: &ReleaseId,
) -> Result<Vec<String>, RemoteError> {
    let listing = session.capture(&RemoteCommand::new("find").args([
        ".",
        "-mindepth",
        "1",
        "-maxdepth",
        "1",
        "-type",
        "d",
        "-regex",
        r"\./[0-9]+",
    ]))?;

    let releases = ReleaseSet::from_listing(&listing);
    let expired = releases.expired(keep, current);
    if expired.is_empty() {
        debug!("{} releases present, keeping up to {keep}", releases.len());
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    let mut failure = None;
    for name in expired {
        info!("remove old release {name}");
        let command = RemoteCommand::new("rm")
            .arg("-rf")
            .path_arg(base_dir.join(name));
        match session.execute(&command) {
            Ok(()) => removed.push(name.to_string()),
            Err(error) => {
                warn!("failed to remove old release {name}: {error}");
                failure.get_or_insert(error);
            }
        }
    }

    match failure {
        Some(error) => Err(error),
        None => Ok(removed),
    }
}

fn at(stage: Stage) -> impl FnOnce(RemoteError) -> DeployError {
    move |source| DeployError::Remote { stage, source }
}

/// Deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Configuration setting is missing or unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Local directory cannot be used.
    #[error(transparent)]
    LocalDir(#[from] LocalDirError),

    /// Remote command or transfer fails.
    #[error("failed to {stage}")]
    Remote {
        stage: Stage,
        #[source]
        source: RemoteError,
    },
}

/// Friendly result alias :3
type Result<T, E = DeployError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    /// Session that answers `find` with a fixed listing.
    #[derive(Debug, Default)]
    struct ScriptedSession {
        listing: String,
        fail_on: Option<String>,
        commands: Vec<String>,
    }

    impl Session for ScriptedSession {
        fn execute(&mut self, command: &RemoteCommand) -> Result<(), RemoteError> {
            let line = command.to_string();
            self.commands.push(line.clone());
            match &self.fail_on {
                Some(needle) if line.contains(needle.as_str()) => {
                    Err(RemoteError::CommandFailed {
                        command: line,
                        status: Some(1),
                        stderr: "Permission denied".into(),
                    })
                }
                _ => Ok(()),
            }
        }

        fn capture(&mut self, command: &RemoteCommand) -> Result<String, RemoteError> {
            self.commands.push(command.to_string());
            Ok(self.listing.clone())
        }

        fn upload(&mut self, _: &Path, _: &Path, _: bool) -> Result<(), RemoteError> {
            Ok(())
        }

        fn push_dir(&mut self, _: &Path) {}

        fn pop_dir(&mut self) {}

        fn close(&mut self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn release(day: u32) -> ReleaseId {
        let time = NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("valid timestamp");
        ReleaseId::from_time(time)
    }

    fn listing(days: impl IntoIterator<Item = u32>) -> String {
        days.into_iter()
            .map(|day| format!("./{}\n", release(day)))
            .collect()
    }

    #[test]
    fn activation_stages_link_then_renames() -> anyhow::Result<()> {
        let mut session = ScriptedSession::default();
        activate_release(&mut session, Path::new("/var/www/app"), &release(1))?;

        let expect = vec![
            "ln -s -f -n /var/www/app/20240101000000 /var/www/app/.current.20240101000000",
            "mv -T -f /var/www/app/.current.20240101000000 /var/www/app/current",
        ];
        assert_eq!(session.commands, expect);

        Ok(())
    }

    #[test]
    fn failed_rename_discards_staged_link() {
        let mut session = ScriptedSession {
            fail_on: Some("mv ".into()),
            ..Default::default()
        };

        let result = activate_release(&mut session, Path::new("/var/www/app"), &release(1));
        assert!(matches!(
            result,
            Err(RemoteError::CommandFailed { ref command, .. }) if command.starts_with("mv ")
        ));

        let expect = vec![
            "ln -s -f -n /var/www/app/20240101000000 /var/www/app/.current.20240101000000",
            "mv -T -f /var/www/app/.current.20240101000000 /var/www/app/current",
            "rm -f /var/www/app/.current.20240101000000",
        ];
        assert_eq!(session.commands, expect);
    }

    #[test]
    fn cleanup_removes_oldest_first() -> anyhow::Result<()> {
        let mut session = ScriptedSession {
            listing: listing([7, 3, 1, 5, 2, 6, 4]),
            ..Default::default()
        };

        let result = clean_old_releases(&mut session, Path::new("/var/www/app"), 5, &release(7))?;
        assert_eq!(result, vec!["20240101000000", "20240102000000"]);

        let expect = vec![
            r"find . -mindepth 1 -maxdepth 1 -type d -regex '\./[0-9]+'",
            "rm -rf /var/www/app/20240101000000",
            "rm -rf /var/www/app/20240102000000",
        ];
        assert_eq!(session.commands, expect);

        Ok(())
    }

    #[test]
    fn cleanup_within_retention_removes_nothing() -> anyhow::Result<()> {
        let mut session = ScriptedSession {
            listing: listing(1..=5),
            ..Default::default()
        };

        let result = clean_old_releases(&mut session, Path::new("/var/www/app"), 5, &release(5))?;
        assert!(result.is_empty());
        assert_eq!(session.commands.len(), 1);

        Ok(())
    }

    #[test]
    fn cleanup_attempts_every_removal() {
        let mut session = ScriptedSession {
            listing: listing(1..=8),
            fail_on: Some("20240101000000".into()),
            ..Default::default()
        };

        let result = clean_old_releases(&mut session, Path::new("/var/www/app"), 5, &release(8));
        assert!(matches!(result, Err(RemoteError::CommandFailed { .. })));

        let removals = session
            .commands
            .iter()
            .filter(|line| line.starts_with("rm -rf"))
            .count();
        assert_eq!(removals, 3);
    }

    #[test]
    fn remote_error_names_stage() {
        let error = at(Stage::Upload)(RemoteError::CommandFailed {
            command: "scp".into(),
            status: Some(1),
            stderr: String::new(),
        });
        assert_eq!(error.to_string(), "failed to upload files");
    }
}
