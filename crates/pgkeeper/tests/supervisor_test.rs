// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor lifecycle tests against real child processes.

mod common;

use std::time::{Duration, Instant};

use common::{ShellService, eventually, fast_config, pidfile_lines};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use pgkeeper::Error;
use pgkeeper::pidfile::{self, PidfileContents};
use pgkeeper::service::{POSTGRES, RestartPolicy};
use pgkeeper::signals::{ControlEvent, StopMode};
use pgkeeper::status::{self, AgentStatus};
use pgkeeper::supervisor::Supervisor;
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_pidfile_lists_every_service_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(dir.path());
    let pidfile_path = config.pidfile.clone();

    let (postgres, postgres_counters) = ShellService::sleeper(POSTGRES);
    let (keeper, keeper_counters) = ShellService::sleeper("node-active");
    let supervisor = Supervisor::new(config, vec![postgres, keeper]);
    let control = supervisor.control_sender();
    let task = tokio::spawn(supervisor.run());

    eventually("pidfile with 3 lines", || pidfile_lines(&pidfile_path) == 3).await;

    let contents = pidfile::read(&pidfile_path).unwrap().unwrap();
    assert_eq!(contents.supervisor, Pid::this());
    assert_eq!(contents.services.len(), 2);
    assert_eq!(contents.services[0].0, POSTGRES);
    assert_eq!(contents.services[1].0, "node-active");
    assert!(matches!(
        status::check(&pidfile_path).unwrap(),
        AgentStatus::Running { .. }
    ));

    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok(), "unexpected {result:?}");

    assert!(!pidfile_path.exists());
    assert_eq!(status::check(&pidfile_path).unwrap(), AgentStatus::NotRunning);
    assert_eq!(postgres_counters.stops(), 1);
    assert_eq!(keeper_counters.stops(), 1);
    assert_eq!(postgres_counters.starts(), 1);
}

#[tokio::test]
async fn test_temporary_services_are_not_relaunched() {
    let dir = TempDir::new().unwrap();
    let (anchor, _) = ShellService::sleeper("anchor");
    let (clean, clean_counters) = ShellService::new("clean", "exit 0", RestartPolicy::Temporary);
    let (crash, crash_counters) = ShellService::new("crash", "exit 1", RestartPolicy::Temporary);

    let supervisor = Supervisor::new(fast_config(dir.path()), vec![anchor, clean, crash]);
    let control = supervisor.control_sender();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let task = tokio::spawn(supervisor.run());

    eventually("temporary services to exit", || pidfile_lines(&pidfile_path) == 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(clean_counters.starts(), 1);
    assert_eq!(crash_counters.starts(), 1);

    control.send(ControlEvent::Stop(StopMode::Fast)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_transient_services_restart_only_after_failures() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.restart.max_restarts = 3;

    let (anchor, _) = ShellService::sleeper("anchor");
    let (quits, quit_counters) = ShellService::new("quits", "exit 0", RestartPolicy::Transient);
    let (fails, fail_counters) = ShellService::new("fails", "exit 3", RestartPolicy::Transient);

    let supervisor = Supervisor::new(config, vec![anchor, quits, fails]);
    let control = supervisor.control_sender();
    let task = tokio::spawn(supervisor.run());

    // one start plus three relaunches, then the ceiling retires it
    eventually("failing service to hit the ceiling", || fail_counters.starts() == 4).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fail_counters.starts(), 4);
    assert_eq!(quit_counters.starts(), 1);

    // a transient service hitting its ceiling does not stop the agent
    assert!(!task.is_finished());

    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_permanent_service_over_the_ceiling_is_fatal() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.restart.max_restarts = 2;
    let pidfile_path = config.pidfile.clone();

    let (anchor, anchor_counters) = ShellService::sleeper("anchor");
    let (flapping, flapping_counters) =
        ShellService::new("flapping", "exit 0", RestartPolicy::Permanent);

    let supervisor = Supervisor::new(config, vec![anchor, flapping]);
    let result = tokio::time::timeout(DEADLINE, supervisor.run()).await.unwrap();

    match result {
        Err(Error::RestartLimit { name }) => assert_eq!(name, "flapping"),
        other => panic!("expected a restart limit error, got {other:?}"),
    }
    assert_eq!(flapping_counters.starts(), 3);
    assert_eq!(anchor_counters.stops(), 1);
    assert!(!pidfile_path.exists());
}

#[tokio::test]
async fn test_second_stop_request_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let (service, counters) = ShellService::sleeper("only");
    let supervisor = Supervisor::new(fast_config(dir.path()), vec![service]);
    let control = supervisor.control_sender();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let task = tokio::spawn(supervisor.run());

    eventually("service to start", || pidfile_lines(&pidfile_path) == 2).await;
    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();

    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(counters.stops(), 1);
}

#[tokio::test]
async fn test_reload_reaches_every_live_service() {
    let dir = TempDir::new().unwrap();
    let (first, first_counters) = ShellService::sleeper("first");
    let (second, second_counters) = ShellService::sleeper("second");
    let supervisor = Supervisor::new(fast_config(dir.path()), vec![first, second]);
    let control = supervisor.control_sender();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let task = tokio::spawn(supervisor.run());

    eventually("services to start", || pidfile_lines(&pidfile_path) == 3).await;
    control.send(ControlEvent::Reload).unwrap();
    eventually("reload to reach both services", || {
        first_counters.reloads() == 1 && second_counters.reloads() == 1
    })
    .await;

    // reload restarts nothing
    assert_eq!(first_counters.starts(), 1);
    assert_eq!(second_counters.starts(), 1);

    control.send(ControlEvent::Stop(StopMode::Immediate)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_failed_startup_stops_started_services() {
    let dir = TempDir::new().unwrap();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let (started, started_counters) = ShellService::sleeper("started");
    let broken = Box::new(ShellService {
        name: "broken",
        program: "/nonexistent/pgkeeper-test-binary",
        script: "",
        policy: RestartPolicy::Permanent,
        counters: Default::default(),
        dir: None,
    });

    let supervisor = Supervisor::new(fast_config(dir.path()), vec![started, broken]);
    let result = tokio::time::timeout(DEADLINE, supervisor.run()).await.unwrap();

    match result {
        Err(Error::ServiceStart { name, .. }) => assert_eq!(name, "broken"),
        other => panic!("expected a start failure, got {other:?}"),
    }
    assert_eq!(started_counters.stops(), 1);
    assert!(!pidfile_path.exists());
}

#[tokio::test]
async fn test_live_pidfile_blocks_a_second_agent() {
    let dir = TempDir::new().unwrap();
    let pidfile_path = dir.path().join("pgkeeper.pid");

    let mut other = std::process::Command::new("/bin/sh")
        .args(["-c", "exec sleep 30"])
        .spawn()
        .unwrap();
    let other_pid = Pid::from_raw(other.id() as i32);
    pidfile::write(&pidfile_path, &PidfileContents::new(other_pid)).unwrap();

    let (service, counters) = ShellService::sleeper("never");
    let result = Supervisor::new(fast_config(dir.path()), vec![service])
        .run()
        .await;

    match result {
        Err(Error::AlreadyRunning { pid, .. }) => assert_eq!(pid, other_pid.as_raw()),
        other => panic!("expected already running, got {other:?}"),
    }
    assert_eq!(counters.starts(), 0);
    assert_eq!(
        pidfile::read(&pidfile_path).unwrap().unwrap().supervisor,
        other_pid
    );

    other.kill().unwrap();
    other.wait().unwrap();
}

#[tokio::test]
async fn test_stale_pidfile_is_taken_over() {
    let dir = TempDir::new().unwrap();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    pidfile::write(
        &pidfile_path,
        &PidfileContents::new(Pid::from_raw(i32::MAX - 1)),
    )
    .unwrap();

    let (service, _) = ShellService::sleeper("only");
    let supervisor = Supervisor::new(fast_config(dir.path()), vec![service]);
    let control = supervisor.control_sender();
    let task = tokio::spawn(supervisor.run());

    eventually("pidfile to be taken over", || {
        pidfile::read(&pidfile_path)
            .ok()
            .flatten()
            .is_some_and(|c| c.supervisor == Pid::this() && c.services.len() == 1)
    })
    .await;

    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_losing_the_pidfile_stops_everything() {
    let dir = TempDir::new().unwrap();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let (service, counters) = ShellService::sleeper("only");
    let supervisor = Supervisor::new(fast_config(dir.path()), vec![service]);
    let task = tokio::spawn(supervisor.run());

    eventually("service to start", || pidfile_lines(&pidfile_path) == 2).await;
    std::fs::remove_file(&pidfile_path).unwrap();

    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::PidfileLost(_))), "got {result:?}");
    assert_eq!(counters.stops(), 1);
}

#[tokio::test]
async fn test_taken_over_pidfile_is_left_to_its_new_owner() {
    let dir = TempDir::new().unwrap();
    let pidfile_path = dir.path().join("pgkeeper.pid");
    let (service, counters) = ShellService::sleeper("only");
    let supervisor = Supervisor::new(fast_config(dir.path()), vec![service]);
    let task = tokio::spawn(supervisor.run());

    eventually("service to start", || pidfile_lines(&pidfile_path) == 2).await;

    let mut other = std::process::Command::new("/bin/sh")
        .args(["-c", "exec sleep 30"])
        .spawn()
        .unwrap();
    let other_pid = Pid::from_raw(other.id() as i32);
    pidfile::write(&pidfile_path, &PidfileContents::new(other_pid)).unwrap();

    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::PidfileLost(_))), "got {result:?}");
    assert_eq!(counters.stops(), 1);

    // the service exit during shutdown must not rewrite or remove it
    let contents = pidfile::read(&pidfile_path).unwrap().unwrap();
    assert_eq!(contents, PidfileContents::new(other_pid));

    other.kill().unwrap();
    other.wait().unwrap();
}

#[tokio::test]
async fn test_stop_escalates_until_the_service_is_killed() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.stop_timeout = Duration::from_millis(200);
    config.escalation_interval = Duration::from_millis(200);
    let pidfile_path = config.pidfile.clone();

    let (stubborn, counters) = ShellService::new(
        "stubborn",
        "trap '' TERM INT QUIT; exec sleep 30",
        RestartPolicy::Permanent,
    );
    let supervisor = Supervisor::new(config, vec![stubborn]);
    let control = supervisor.control_sender();
    let task = tokio::spawn(supervisor.run());

    eventually("service to start", || pidfile_lines(&pidfile_path) == 2).await;
    // let the shell install its traps before signaling it
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stopping = Instant::now();
    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();

    assert!(result.is_ok(), "unexpected {result:?}");
    // graceful, fast and immediate were each tried before SIGKILL
    assert_eq!(counters.stops(), 3);
    assert!(stopping.elapsed() >= Duration::from_millis(600));
    assert!(!pidfile_path.exists());
}

#[tokio::test]
async fn test_stable_service_gets_its_restarts_back() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(dir.path());
    config.restart.max_restarts = 1;
    config.restart.window = Duration::from_secs(60);
    config.restart.stable_period = Duration::from_millis(300);
    let pidfile_path = config.pidfile.clone();

    // fails on its first run only
    let (recovers, counters) = ShellService::in_dir(
        "recovers",
        "if [ -e started ]; then exec sleep 30; fi; touch started; exit 1",
        RestartPolicy::Permanent,
        dir.path(),
    );
    let supervisor = Supervisor::new(config, vec![recovers]);
    let control = supervisor.control_sender();
    let task = tokio::spawn(supervisor.run());

    eventually("service to be relaunched", || {
        counters.starts() == 2 && pidfile_lines(&pidfile_path) == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // with the counters still set this crash would exceed max_restarts
    let pid = pidfile::read(&pidfile_path)
        .unwrap()
        .unwrap()
        .service_pid("recovers")
        .unwrap();
    signal::kill(pid, Signal::SIGKILL).unwrap();

    eventually("service to be relaunched again", || counters.starts() == 3).await;
    assert!(!task.is_finished());

    control.send(ControlEvent::Stop(StopMode::Graceful)).unwrap();
    let result = tokio::time::timeout(DEADLINE, task).await.unwrap().unwrap();
    assert!(result.is_ok(), "unexpected {result:?}");
}
