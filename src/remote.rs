// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote command execution and file transfer.
//!
//! Deployment talks to the remote host through a [`Transport`] that opens a
//! [`Session`]. A session runs commands, captures their output, copies local
//! files over, and can scope commands to a remote working directory.
//!
//! # Scoped Resources
//!
//! Sessions and directory scopes are always released, no matter how a
//! deployment ends. Wrap a fresh session in a [`SessionGuard`] to have it
//! closed on drop, and use [`within`] to enter a remote directory for as long
//! as the returned [`Within`] lives.
//!
//! # OpenSSH
//!
//! [`OpenSsh`] is the transport used in production. It shells out to the
//! `ssh` and `scp` binaries. Connecting starts a control master in the
//! background so that every command and transfer of the session reuses one
//! authenticated connection. Closing the session tells the master to exit.

use std::{
    env::temp_dir,
    ffi::{OsStr, OsString},
    fmt::{Display, Formatter, Result as FmtResult},
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, instrument, warn};

/// Remote account to deploy as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
}

impl Target {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: None,
        }
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        self.port = port;
        self
    }
}

impl Display for Target {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}@{}", self.user, self.host)
    }
}

/// Command to run on the remote host.
///
/// Arguments are kept apart from one another, and only joined into a shell
/// command line with proper quoting when rendered through [`Display`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
}

impl RemoteCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_string()));
        self
    }

    /// Add path as argument.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        self.arg(path.as_ref().to_string_lossy())
    }

    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    pub fn arguments(&self) -> &[String] {
        self.args.as_slice()
    }
}

impl Display for RemoteCommand {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&shell_escape(&self.program))?;
        for arg in &self.args {
            fmt.write_str(" ")?;
            fmt.write_str(&shell_escape(arg))?;
        }

        Ok(())
    }
}

/// Quote word for a POSIX shell.
///
/// Words made only of characters the shell treats literally are left alone.
/// Anything else is wrapped in single quotes, with embedded single quotes
/// closed, escaped, and reopened.
pub fn shell_escape(word: &str) -> String {
    let is_plain = |c: char| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c);
    if !word.is_empty() && word.chars().all(is_plain) {
        return word.to_string();
    }

    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Way to reach a remote host.
pub trait Transport {
    type Session: Session;

    /// Open session bound to target account.
    fn connect(&self, target: &Target) -> Result<Self::Session>;
}

/// Open connection to a remote host.
pub trait Session {
    /// Run command, failing if it exits non-zero.
    fn execute(&mut self, command: &RemoteCommand) -> Result<()>;

    /// Run command and return its standard output.
    fn capture(&mut self, command: &RemoteCommand) -> Result<String>;

    /// Copy local path to remote path.
    fn upload(&mut self, local: &Path, remote: &Path, recursive: bool) -> Result<()>;

    /// Run subsequent commands from inside remote directory.
    fn push_dir(&mut self, dir: &Path);

    /// Leave directory entered last.
    fn pop_dir(&mut self);

    /// Tear down connection.
    fn close(&mut self) -> Result<()>;
}

/// Session that gets closed when dropped.
#[derive(Debug)]
pub struct SessionGuard<S: Session> {
    session: S,
}

impl<S: Session> SessionGuard<S> {
    pub fn new(session: S) -> Self {
        Self { session }
    }
}

impl<S: Session> Deref for SessionGuard<S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<S: Session> DerefMut for SessionGuard<S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

impl<S: Session> Drop for SessionGuard<S> {
    fn drop(&mut self) {
        if let Err(error) = self.session.close() {
            warn!("failed to close remote session: {error}");
        }
    }
}

/// Remote directory scope that is left when dropped.
#[derive(Debug)]
pub struct Within<'s, S: Session + ?Sized> {
    session: &'s mut S,
}

/// Enter remote directory for the lifetime of returned scope.
pub fn within<'s, S: Session + ?Sized>(session: &'s mut S, dir: &Path) -> Within<'s, S> {
    session.push_dir(dir);
    Within { session }
}

impl<S: Session + ?Sized> Deref for Within<'_, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<S: Session + ?Sized> DerefMut for Within<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<S: Session + ?Sized> Drop for Within<'_, S> {
    fn drop(&mut self) {
        self.session.pop_dir();
    }
}

/// Transport through the OpenSSH client binaries.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    ssh: OsString,
    scp: OsString,
    control_dir: PathBuf,
}

impl OpenSsh {
    /// Use `ssh` and `scp` found in `PATH`.
    pub fn new() -> Self {
        Self {
            ssh: "ssh".into(),
            scp: "scp".into(),
            control_dir: temp_dir(),
        }
    }
}

impl Default for OpenSsh {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for OpenSsh {
    type Session = OpenSshSession;

    #[instrument(skip(self), level = "debug")]
    fn connect(&self, target: &Target) -> Result<Self::Session> {
        // INVARIANT: ssh expands %C into a hash of the connection parameters,
        //   so the socket path stays short enough for a unix socket.
        let control_path = self
            .control_dir
            .join(format!("sitedrop-{}-%C", std::process::id()));

        let mut session = OpenSshSession {
            target: target.clone(),
            ssh: self.ssh.clone(),
            scp: self.scp.clone(),
            control_path,
            dirs: Vec::new(),
            open: false,
        };

        let mut args = session.ssh_options();
        args.extend(["-M", "-N", "-f", "-o", "ControlPersist=yes"].map(OsString::from));
        args.push(session.target.to_string().into());
        syscall(&session.ssh, args, "start control master")?;
        session.open = true;

        Ok(session)
    }
}

/// Session multiplexed over an OpenSSH control master.
#[derive(Debug)]
pub struct OpenSshSession {
    target: Target,
    ssh: OsString,
    scp: OsString,
    control_path: PathBuf,
    dirs: Vec<PathBuf>,
    open: bool,
}

impl OpenSshSession {
    fn ssh_options(&self) -> Vec<OsString> {
        let mut options: Vec<OsString> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()).into(),
        ];

        if let Some(port) = self.target.port {
            options.extend(["-p".into(), port.to_string().into()]);
        }

        options
    }

    fn scp_options(&self) -> Vec<OsString> {
        let mut options: Vec<OsString> = vec![
            "-q".into(),
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()).into(),
        ];

        if let Some(port) = self.target.port {
            options.extend(["-P".into(), port.to_string().into()]);
        }

        options
    }

    /// Render command line, prefixed with the current directory scope.
    fn command_line(&self, command: &RemoteCommand) -> String {
        match self.dirs.last() {
            Some(dir) => format!(
                "cd {} && {command}",
                shell_escape(&dir.to_string_lossy())
            ),
            None => command.to_string(),
        }
    }

    fn run(&self, command: &RemoteCommand) -> Result<String> {
        let line = self.command_line(command);
        debug!("{}: {line}", self.target);

        let mut args = self.ssh_options();
        args.push(self.target.to_string().into());
        args.push("--".into());
        args.push(line.clone().into());
        syscall(&self.ssh, args, line)
    }
}

impl Session for OpenSshSession {
    fn execute(&mut self, command: &RemoteCommand) -> Result<()> {
        self.run(command).map(|_| ())
    }

    fn capture(&mut self, command: &RemoteCommand) -> Result<String> {
        self.run(command)
    }

    /// Copy `local` to `remote` with `scp`.
    ///
    /// The remote path is handed over without shell quoting. Current `scp`
    /// transfers over SFTP and takes it literally, but the legacy protocol
    /// (`scp -O`) lets the remote shell expand it, so base directories with
    /// spaces or glob characters are not supported there.
    #[instrument(skip(self), level = "debug")]
    fn upload(&mut self, local: &Path, remote: &Path, recursive: bool) -> Result<()> {
        // INVARIANT: Relative names like "-foo" must not be taken for flags.
        let local = if local.is_relative() && !local.starts_with(".") {
            Path::new(".").join(local)
        } else {
            local.to_path_buf()
        };

        let mut args = self.scp_options();
        if recursive {
            args.push("-r".into());
        }
        args.push(local.clone().into_os_string());
        args.push(format!("{}:{}", self.target, remote.display()).into());

        let description = format!("scp {} {}:{}", local.display(), self.target, remote.display());
        debug!("{description}");
        syscall(&self.scp, args, description).map(|_| ())
    }

    fn push_dir(&mut self, dir: &Path) {
        self.dirs.push(dir.to_path_buf());
    }

    fn pop_dir(&mut self) {
        self.dirs.pop();
    }

    fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }

        self.open = false;
        let mut args = self.ssh_options();
        args.extend(["-O".into(), "exit".into(), self.target.to_string().into()]);
        syscall(&self.ssh, args, "stop control master").map(|_| ())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!("failed to stop control master for {}: {error}", self.target);
        }
    }
}

fn syscall(
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
    description: impl Into<String>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| RemoteError::Spawn {
            source,
            program: cmd.as_ref().to_string_lossy().into_owned(),
        })?;

    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(output.stderr.as_slice());
        return Err(RemoteError::CommandFailed {
            command: description.into(),
            status: output.status.code(),
            stderr: stderr.trim_end().to_string(),
        });
    }

    Ok(stdout)
}

/// Remote execution error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Client binary cannot be started.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Remote command or transfer exited unsuccessfully.
    #[error("command {command:?} failed ({}): {stderr}", exit_status(*status))]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
}

fn exit_status(status: Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Friendly result alias :3
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;
