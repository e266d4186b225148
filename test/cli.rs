// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use anyhow::Result;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    fs::write,
    process::{Command, Output},
};

fn sitedrop(config: &str) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_sitedrop"))
        .arg(config)
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .output()?;

    Ok(output)
}

#[sealed_test]
fn unreadable_config_exits_with_failure() -> Result<()> {
    let output = sitedrop("nowhere/deploy.toml")?;

    assert_eq!(output.status.code(), Some(1));
    let log = String::from_utf8_lossy(&output.stdout);
    assert!(log.contains("cannot load \"nowhere/deploy.toml\""), "{log}");

    Ok(())
}

#[sealed_test]
fn incomplete_config_exits_before_connecting() -> Result<()> {
    write(
        "deploy.toml",
        "local_dir = '.'\nremote_user = 'dep'\nremote_base_dir = '/var/www/app'\n",
    )?;

    let output = sitedrop("deploy.toml")?;

    assert_eq!(output.status.code(), Some(1));
    let log = String::from_utf8_lossy(&output.stdout);
    assert!(log.contains("missing configuration key `remote_host`"), "{log}");
    assert!(!log.contains("connect to"), "{log}");

    Ok(())
}
