// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor pidfile.
//!
//! Layout, one entry per line:
//!
//! ```text
//! 4242              <- supervisor pid
//! postgres 4243
//! node-active 4250
//! listener 4251
//! ```
//!
//! The file is rewritten as a whole (temporary file + rename) whenever a
//! service pid changes, so readers never see a half-written file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Parsed pidfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidfileContents {
    /// Supervisor pid.
    pub supervisor: Pid,
    /// `(service name, pid)` in start order.
    pub services: Vec<(String, Pid)>,
}

impl PidfileContents {
    /// Contents naming only the supervisor.
    pub fn new(supervisor: Pid) -> Self {
        Self {
            supervisor,
            services: Vec::new(),
        }
    }

    /// Pid recorded for `name`.
    pub fn service_pid(&self, name: &str) -> Option<Pid> {
        self.services
            .iter()
            .find(|(service, _)| service == name)
            .map(|(_, pid)| *pid)
    }

    fn render(&self) -> String {
        let mut out = format!("{}\n", self.supervisor);
        for (name, pid) in &self.services {
            out.push_str(&format!("{} {}\n", name, pid));
        }
        out
    }

    fn parse(path: &Path, text: &str) -> Result<Self> {
        let invalid = |reason: String| Error::Pidfile {
            path: path.to_path_buf(),
            reason,
        };

        let mut lines = text.lines();
        let first = lines
            .next()
            .ok_or_else(|| invalid("empty file".to_string()))?;
        let supervisor = parse_pid(first.trim())
            .ok_or_else(|| invalid(format!("bad supervisor pid {:?}", first)))?;

        let mut services = Vec::new();
        for line in lines.filter(|l| !l.trim().is_empty()) {
            let (name, pid) = line
                .trim()
                .split_once(' ')
                .ok_or_else(|| invalid(format!("bad service line {:?}", line)))?;
            let pid = parse_pid(pid.trim())
                .ok_or_else(|| invalid(format!("bad pid for service {}", name)))?;
            services.push((name.to_string(), pid));
        }

        Ok(Self {
            supervisor,
            services,
        })
    }
}

fn parse_pid(text: &str) -> Option<Pid> {
    text.parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
}

/// Whether `pid` names a live process.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn is_alive(pid: Pid) -> bool {
    match signal::kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Write the pidfile atomically.
pub fn write(path: &Path, contents: &PidfileContents) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, contents.render())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Create the pidfile, returning `false` when one already exists.
///
/// The contents are written aside and hard-linked into place, so of two
/// agents racing for the same path exactly one wins, and neither can see
/// the other's file half-written.
pub fn create(path: &Path, contents: &PidfileContents) -> Result<bool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".{}.new", contents.supervisor));
    let staged = PathBuf::from(staged);

    fs::write(&staged, contents.render())?;
    let linked = fs::hard_link(&staged, path);
    fs::remove_file(&staged)?;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Read the pidfile, `None` when it does not exist.
pub fn read(path: &Path) -> Result<Option<PidfileContents>> {
    match fs::read_to_string(path) {
        Ok(text) => PidfileContents::parse(path, &text).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Read the pidfile and drop it when its supervisor is gone.
///
/// Returns `None` when there is no pidfile or it was stale.
pub fn read_live(path: &Path) -> Result<Option<PidfileContents>> {
    let Some(contents) = read(path)? else {
        return Ok(None);
    };

    if is_alive(contents.supervisor) {
        return Ok(Some(contents));
    }

    info!(
        pid = %contents.supervisor,
        path = %path.display(),
        "Removing stale pidfile"
    );
    remove(path)?;
    Ok(None)
}

/// Remove the pidfile, ignoring a missing file.
pub fn remove(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!(error = %e, path = %path.display(), "Failed to remove pidfile");
            Err(e.into())
        }
    }
}

/// Remove the pidfile if `owner` is still the supervisor it names.
///
/// Returns whether the file was removed.
pub fn remove_owned(path: &Path, owner: Pid) -> Result<bool> {
    match read(path) {
        Ok(Some(contents)) if contents.supervisor == owner => remove(path).map(|()| true),
        Ok(Some(contents)) => {
            warn!(
                path = %path.display(),
                owner = %contents.supervisor,
                "Pidfile belongs to another supervisor, leaving it"
            );
            Ok(false)
        }
        Ok(None) => Ok(false),
        Err(Error::Pidfile { reason, .. }) => {
            warn!(path = %path.display(), reason = %reason, "Pidfile is unreadable, leaving it");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Pid of service `name` as recorded by a live supervisor.
///
/// Reads the file only: usable from processes that are not the supervisor.
pub fn find_service_pid(path: &Path, name: &str) -> Result<Option<Pid>> {
    Ok(read_live(path)?.and_then(|contents| contents.service_pid(name)))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}
