// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! pgkeeper - Postgres high-availability keeper
//!
//! `pgkeeper run` supervises the local Postgres instance together with the
//! keeper loop and the notification listener; the other subcommands talk to
//! a running agent through its pidfile or query the monitor directly.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pgkeeper::commands::{self, ShowTarget};
use pgkeeper::config::ConfigError;
use pgkeeper::observer::LocalPostgres;
use pgkeeper::signals::StopMode;
use pgkeeper::status;
use pgkeeper::{Config, Error, ExitCode};
use pgkeeper_monitor::{MonitorError, PostgresMonitor};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// pgkeeper - keeps a Postgres node in its formation
#[derive(Parser, Debug)]
#[command(name = "pgkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// More logging, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn default_directive(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "pgkeeper=warn",
            (false, 0) => "pgkeeper=info",
            (false, 1) => "pgkeeper=debug,pgkeeper_monitor=debug",
            (false, _) => "pgkeeper=trace,pgkeeper_monitor=trace,pgkeeper_protocol=trace",
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Supervise Postgres, the keeper loop and the listener
    Run,

    /// Stop a running agent (graceful by default)
    Stop {
        /// Abort in-flight work
        #[arg(long, conflicts_with = "immediate")]
        fast: bool,

        /// Exit without cleanup
        #[arg(long)]
        immediate: bool,
    },

    /// Make a running agent reload its configuration
    Reload,

    /// Report whether the agent and Postgres are running
    Status,

    /// Register this node with the monitor
    Register,

    /// Show local state or formation topology
    Show {
        #[command(subcommand)]
        what: ShowCommand,
    },

    /// Internal entry points used by the supervisor
    #[command(hide = true)]
    Do {
        #[command(subcommand)]
        what: DoCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ShowCommand {
    /// Local keeper state
    State,
    /// Primary of this node's group
    Primary,
    /// Other nodes of this node's group
    Nodes,
    /// Coordinator of the formation
    Coordinator,
    /// Pid of the supervisor, or of one of its services
    Pid {
        /// Service name, e.g. postgres
        service: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum DoCommand {
    /// Run one supervised service in the foreground
    Service {
        #[arg(value_enum)]
        name: ServiceName,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ServiceName {
    NodeActive,
    Listener,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() {
                ExitCode::BadArgs
            } else {
                ExitCode::Quit
            };
            let _ = e.print();
            std::process::exit(code.code());
        }
    };

    // Children inherit the effective filter, not just the default.
    let log_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| cli.default_directive().to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&log_filter).unwrap_or_else(|_| cli.default_directive().into()),
        )
        .init();

    let code = match execute(cli, &log_filter).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code.code());
}

fn exit_code(error: &anyhow::Error) -> ExitCode {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<Error>() {
            return e.exit_code();
        }
        if cause.is::<ConfigError>() {
            return ExitCode::BadConfig;
        }
        if cause.is::<MonitorError>() {
            return ExitCode::Monitor;
        }
    }
    ExitCode::InternalError
}

async fn connect_monitor(config: &Config) -> anyhow::Result<PostgresMonitor> {
    let uri = config.require_monitor()?;
    PostgresMonitor::connect(uri, config.connect_timeout)
        .await
        .context("Failed to connect to the monitor")
}

async fn execute(cli: Cli, log_filter: &str) -> anyhow::Result<ExitCode> {
    let config = Config::load()?;

    match cli.command {
        Command::Run => {
            commands::run(&config, log_filter).await?;
        }

        Command::Stop { fast, immediate } => {
            let mode = match (fast, immediate) {
                (_, true) => StopMode::Immediate,
                (true, false) => StopMode::Fast,
                (false, false) => StopMode::Graceful,
            };
            commands::stop(&config.pidfile, mode)?;
        }

        Command::Reload => {
            commands::reload(&config.pidfile)?;
        }

        Command::Status => {
            let status = status::check(&config.pidfile)?;
            println!("{}", status);
            return Ok(status.exit_code());
        }

        Command::Register => {
            let monitor = connect_monitor(&config).await?;
            let observer = LocalPostgres::connect_lazy(&config.local_uri, config.connect_timeout)?;
            let state = commands::register(&config, &monitor, &observer).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Command::Show { what } => {
            let target = match what {
                ShowCommand::State => {
                    println!("{}", commands::show_state(&config)?);
                    return Ok(ExitCode::Quit);
                }
                ShowCommand::Pid { service } => {
                    return match commands::pid(&config.pidfile, service.as_deref())? {
                        Some(pid) => {
                            println!("{}", pid);
                            Ok(ExitCode::Quit)
                        }
                        None => Ok(ExitCode::STATUS_NOT_RUNNING),
                    };
                }
                ShowCommand::Primary => ShowTarget::Primary,
                ShowCommand::Nodes => ShowTarget::Nodes,
                ShowCommand::Coordinator => ShowTarget::Coordinator,
            };
            let monitor = connect_monitor(&config).await?;
            println!("{}", commands::show(&config, &monitor, target).await?);
        }

        Command::Do {
            what: DoCommand::Service { name },
        } => match name {
            ServiceName::NodeActive => commands::node_active_service(config).await?,
            ServiceName::Listener => commands::listener_service(config).await?,
        },
    }

    Ok(ExitCode::Quit)
}
