// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release naming and retention.
//!
//! Every deployment lands in its own __release__ directory under the remote
//! base directory, named after the local time the deployment started in
//! `YYYYMMDDHHMMSS` form. The fixed width means sorting release names as plain
//! strings also sorts them by age, which is what the retention policy relies
//! on when it decides which releases to delete.

use chrono::{Local, NaiveDateTime};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter, Result as FmtResult},
};

const RELEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";

/// Source of the time a deployment starts at.
pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Timestamp naming a release directory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReleaseId(String);

impl ReleaseId {
    /// Name release after given point in time.
    pub fn from_time(time: NaiveDateTime) -> Self {
        Self(time.format(RELEASE_ID_FORMAT).to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for ReleaseId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

/// Check if directory name looks like a release.
///
/// Any non-empty run of ASCII digits counts, not only names of the exact
/// timestamp width.
pub fn is_release_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|byte| byte.is_ascii_digit())
}

/// Releases present on the remote host, oldest first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReleaseSet {
    releases: BTreeSet<String>,
}

impl ReleaseSet {
    /// Parse directory listing produced by `find` inside the base directory.
    ///
    /// Expects one entry per line, optionally prefixed with `./`. Lines that
    /// are not release names are ignored.
    pub fn from_listing(listing: &str) -> Self {
        let releases = listing
            .lines()
            .map(str::trim)
            .map(|line| line.strip_prefix("./").unwrap_or(line))
            .filter(|name| is_release_name(name))
            .map(ToString::to_string)
            .collect();

        Self { releases }
    }

    pub fn len(&self) -> usize {
        self.releases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.releases.iter().map(String::as_str)
    }

    /// Releases to delete so that only the newest `keep` remain.
    ///
    /// Comes back oldest first. Empty when the set holds `keep` releases or
    /// fewer. The `protected` release is never part of the result.
    pub fn expired(&self, keep: usize, protected: &ReleaseId) -> Vec<&str> {
        let excess = self.releases.len().saturating_sub(keep);
        self.iter()
            .take(excess)
            .filter(|name| *name != protected.as_str())
            .collect()
    }
}

impl<'a> FromIterator<&'a str> for ReleaseSet {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let releases = iter
            .into_iter()
            .filter(|name| is_release_name(name))
            .map(ToString::to_string)
            .collect();

        Self { releases }
    }
}
