// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process signals as control events.
//!
//! | signal  | event                      |
//! |---------|----------------------------|
//! | SIGTERM | stop, graceful             |
//! | SIGINT  | stop, fast                 |
//! | SIGQUIT | stop, immediate            |
//! | SIGHUP  | reload configuration       |
//!
//! The same mapping is used in the other direction when a stop is sent to a
//! child, and matches Postgres' smart/fast/immediate shutdown modes.
//!
//! Signal handling never acts on its own: it posts a [`ControlEvent`] into
//! the owning loop's channel.

use std::fmt;

use nix::sys::signal::Signal;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How hard a stop request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopMode {
    /// Let every service finish what it is doing.
    Graceful,
    /// Abort in-flight work, clean up, exit.
    Fast,
    /// Exit now.
    Immediate,
}

impl StopMode {
    /// Signal carrying this stop mode.
    pub fn signal(self) -> Signal {
        match self {
            StopMode::Graceful => Signal::SIGTERM,
            StopMode::Fast => Signal::SIGINT,
            StopMode::Immediate => Signal::SIGQUIT,
        }
    }

    /// Next stronger mode, `None` after immediate.
    pub fn escalate(self) -> Option<StopMode> {
        match self {
            StopMode::Graceful => Some(StopMode::Fast),
            StopMode::Fast => Some(StopMode::Immediate),
            StopMode::Immediate => None,
        }
    }
}

impl fmt::Display for StopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopMode::Graceful => "graceful",
            StopMode::Fast => "fast",
            StopMode::Immediate => "immediate",
        })
    }
}

/// Event delivered to a supervisor or service loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Stop with the given mode.
    Stop(StopMode),
    /// Reload configuration.
    Reload,
}

/// Listen for SIGTERM, SIGINT, SIGQUIT and SIGHUP and post the matching
/// [`ControlEvent`] into `tx` until the receiver goes away.
pub fn forward_signals(tx: mpsc::UnboundedSender<ControlEvent>) -> std::io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                Some(()) = term.recv() => ControlEvent::Stop(StopMode::Graceful),
                Some(()) = int.recv() => ControlEvent::Stop(StopMode::Fast),
                Some(()) = quit.recv() => ControlEvent::Stop(StopMode::Immediate),
                Some(()) = hup.recv() => ControlEvent::Reload,
                else => break,
            };
            debug!(event = ?event, "Received signal");
            if tx.send(event).is_err() {
                break;
            }
        }
    }))
}
