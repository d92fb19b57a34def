// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for supervisor tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nix::unistd::Pid;
use pgkeeper::Result;
use pgkeeper::service::{self, RestartPolicy, Service};
use pgkeeper::signals::StopMode;
use pgkeeper::supervisor::SupervisorConfig;
use tokio::process::{Child, Command};

/// How often each lifecycle operation was called.
#[derive(Default, Debug)]
pub struct Counters {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub reloads: AtomicUsize,
}

impl Counters {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

/// A service running a shell script.
pub struct ShellService {
    pub name: &'static str,
    pub program: &'static str,
    pub script: &'static str,
    pub policy: RestartPolicy,
    pub counters: Arc<Counters>,
    /// Working directory of the script, the supervisor's when `None`.
    pub dir: Option<PathBuf>,
}

impl ShellService {
    pub fn new(name: &'static str, script: &'static str, policy: RestartPolicy) -> (Box<dyn Service>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let service = ShellService {
            name,
            program: "/bin/sh",
            script,
            policy,
            counters: counters.clone(),
            dir: None,
        };
        (Box::new(service), counters)
    }

    /// A service running `script` inside `dir`.
    pub fn in_dir(
        name: &'static str,
        script: &'static str,
        policy: RestartPolicy,
        dir: &Path,
    ) -> (Box<dyn Service>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let service = ShellService {
            name,
            program: "/bin/sh",
            script,
            policy,
            counters: counters.clone(),
            dir: Some(dir.to_path_buf()),
        };
        (Box::new(service), counters)
    }

    /// A long-running permanent service.
    pub fn sleeper(name: &'static str) -> (Box<dyn Service>, Arc<Counters>) {
        Self::new(name, "exec sleep 30", RestartPolicy::Permanent)
    }
}

impl Service for ShellService {
    fn name(&self) -> &str {
        self.name
    }

    fn restart_policy(&self) -> RestartPolicy {
        self.policy
    }

    fn command(&self) -> Command {
        let mut command = Command::new(self.program);
        command.args(["-c", self.script]);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }
        command
    }

    fn start(&self) -> Result<Child> {
        self.counters.starts.fetch_add(1, Ordering::SeqCst);
        service::spawn(self.name, self.command())
    }

    fn stop(&self, pid: Pid, mode: StopMode) -> Result<()> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        service::send(pid, mode.signal())
    }

    fn reload(&self, _pid: Pid) -> Result<()> {
        // sleep(1) would die on SIGHUP, count only
        self.counters.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Supervisor settings with short delays.
pub fn fast_config(dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::new(dir.join("pgkeeper.pid"));
    config.restart.backoff_base = Duration::from_millis(10);
    config.restart.backoff_max = Duration::from_millis(50);
    config.stop_timeout = Duration::from_secs(5);
    config.escalation_interval = Duration::from_secs(2);
    config.housekeeping_interval = Duration::from_millis(50);
    config
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Number of lines in the pidfile, 0 when it does not exist.
pub fn pidfile_lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|text| text.lines().count())
        .unwrap_or(0)
}
