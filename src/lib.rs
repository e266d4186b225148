// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release-based static file deployment over SSH.
//!
//! Sitedrop uploads an already built directory tree to a remote host as a new
//! timestamped __release__, switches the `current` link over to it, and
//! removes releases that are too old to keep around.
//!
//! # See Also
//!
//! 1. [`deploy`] for the deployment steps.
//! 2. [`config`] for the configuration file layout.

pub mod config;
pub mod deploy;
pub mod path;
pub mod release;
pub mod remote;

pub use config::{Config, ConfigError, Setting};
pub use deploy::{DeployError, DeployReport, DeployState, Deployer, Stage};
pub use release::{Clock, ReleaseId, SystemClock};
pub use remote::{OpenSsh, RemoteCommand, RemoteError, Session, Target, Transport};
