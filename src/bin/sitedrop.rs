// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use sitedrop::{Config, Deployer};

use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Deploy a directory of static files to a remote host as a new release.
#[derive(Debug, Clone, Parser)]
#[command(about, override_usage = "sitedrop <config>", version)]
struct Cli {
    /// Path to deployment configuration file.
    #[arg(value_name = "config")]
    pub config: PathBuf,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config = Config::load(&self.config)
            .with_context(|| format!("cannot load {:?}", self.config.display()))?;
        let report = Deployer::new(config).deploy()?;
        info!(
            "deployed {} entries to {:?}",
            report.uploaded.len(),
            report.release_path.display()
        );
        if !report.pruned.is_empty() {
            info!("removed old releases: {}", report.pruned.join(", "));
        }

        Ok(())
    }
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}
