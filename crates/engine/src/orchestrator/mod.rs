// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Test-run orchestration.
//!
//! The [`Orchestrator`] discovers the annotated tests, starts one builder per
//! toolchain, and for every test brings up the emulated device and the
//! native debug stub, runs both debug sessions against the comparator and
//! tears everything down again. In [`RunMode::Reuse`] the device survives
//! between tests and is reset through its management console instead.
//!
//! The first failure of any kind ends the run; every child process is killed
//! on the way out.

mod monitor;
mod ports;
mod process;

pub use monitor::MonitorClient;
pub use ports::{connect_with_retry, free_ports};
pub use process::{GroupChild, ProcessSupervisor};
pub(crate) use process::GroupGuard;

use std::{ffi::OsStr, fs, path::Path, sync::Arc};

use c2t_common::{Arch, Artifact, BreakpointSpec, TestCase};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    annotation::parse_file,
    builder::Builder,
    comparator::compare,
    config::{render, C2tConfig, RunMode},
    image::{ElfLoader, ImageLoader},
    rsp::RegisterLayout,
    session::{DebugSession, SessionKind, SessionState, TargetBoot},
    C2tError, C2tResult,
};

/// Capacity of each session's dump stream.
pub const DUMP_QUEUE: usize = 16;

/// A discovered test and its directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTest {
    /// The test source
    pub test: TestCase,
    /// Directives in line order
    pub specs: Vec<BreakpointSpec>,
}

/// Knobs of one run that do not belong in the configuration file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only run matching tests, overriding the configured filter
    pub filter: Option<Regex>,
    /// Device management mode, overriding the configured one
    pub mode: Option<RunMode>,
    /// Kill children immediately instead of letting them exit gracefully
    pub kill: bool,
    /// Draw a progress bar
    pub progress: bool,
}

/// Result of a run where every test passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Names of the passed tests, in run order
    pub passed: Vec<String>,
}

/// Find the annotated tests in `tests_dir`, sorted by name.
///
/// Only `.c` files are considered. Files without directives are skipped.
pub fn discover_tests(tests_dir: &Path, filter: Option<&Regex>) -> C2tResult<Vec<PlannedTest>> {
    let entries = fs::read_dir(tests_dir).map_err(|e| {
        C2tError::Config(format!("cannot read tests directory {}: {e}", tests_dir.display()))
    })?;
    let mut tests = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(OsStr::to_str) != Some("c") {
            continue;
        }
        let Some(test) = TestCase::from_path(path.clone()) else {
            continue;
        };
        if filter.is_some_and(|re| !re.is_match(test.name())) {
            continue;
        }
        let specs = parse_file(&path)?;
        if specs.is_empty() {
            warn!(test = test.name(), "Test has no directives, skipping");
            continue;
        }
        tests.push(PlannedTest { test, specs });
    }
    tests.sort_by(|a, b| a.test.name().cmp(b.test.name()));
    Ok(tests)
}

/// The emulated device and the debug session attached to it.
struct Device {
    emulator: GroupChild,
    port: u16,
    monitor: Option<MonitorClient>,
    session: Option<DebugSession>,
}

/// Drives a whole differential run.
pub struct Orchestrator {
    config: C2tConfig,
    options: RunOptions,
    mode: RunMode,
    filter: Option<Regex>,
    target_layout: RegisterLayout,
    oracle_layout: RegisterLayout,
    loader: Arc<dyn ImageLoader>,
    supervisor: ProcessSupervisor,
}

impl Orchestrator {
    /// Validate `config` and prepare a run. No process is started yet.
    pub fn new(config: C2tConfig, options: RunOptions) -> C2tResult<Self> {
        config.validate()?;
        let mode = options.mode.unwrap_or(config.mode);
        if mode == RunMode::Reuse && !config.target.emulator.contains("{control_port}") {
            return Err(C2tError::Config(
                "reuse mode needs {control_port} in the emulator command".into(),
            ));
        }
        let filter = match &options.filter {
            Some(filter) => Some(filter.clone()),
            None => config
                .test_filter
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| C2tError::Config(format!("bad test filter: {e}")))?,
        };
        let target_layout = config.target.machine.layout()?;
        let oracle_layout = config.oracle.machine.layout()?;
        let supervisor = ProcessSupervisor::new(config.work_dir.join("logs"));
        Ok(Self {
            config,
            options,
            mode,
            filter,
            target_layout,
            oracle_layout,
            loader: Arc::new(ElfLoader),
            supervisor,
        })
    }

    /// Use `loader` instead of reading ELF files.
    pub fn with_image_loader(mut self, loader: impl ImageLoader + 'static) -> Self {
        self.loader = Arc::new(loader);
        self
    }

    /// Handle to the children of this run, e.g. to kill them on interrupt.
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Effective device management mode.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Tests this run would execute.
    pub fn discover(&self) -> C2tResult<Vec<PlannedTest>> {
        discover_tests(&self.config.tests_dir, self.filter.as_ref())
    }

    /// Build, run and compare every test, stopping at the first failure.
    pub async fn run(&self) -> C2tResult<RunSummary> {
        let tests = self.discover()?;
        if tests.is_empty() {
            warn!(dir = %self.config.tests_dir.display(), "No tests to run");
            return Ok(RunSummary::default());
        }
        info!(
            tests = tests.len(),
            mode = %self.mode,
            target = %self.config.target.machine.arch,
            oracle = %self.config.oracle.machine.arch,
            "Starting run"
        );

        let cases: Vec<TestCase> = tests.iter().map(|t| t.test.clone()).collect();
        let work_dir = &self.config.work_dir;
        let (mut target_queue, target_builds) = Builder::new(
            self.config.target.machine.arch.clone(),
            self.config.target.build.clone(),
            work_dir,
        )
        .spawn(cases.clone());
        let (mut oracle_queue, oracle_builds) = Builder::new(
            self.config.oracle.machine.arch.clone(),
            self.config.oracle.build.clone(),
            work_dir,
        )
        .spawn(cases);

        let progress = self.progress_bar(tests.len());
        let mut device = None;
        let mut summary = RunSummary::default();
        let mut outcome = Ok(());
        for planned in &tests {
            progress.set_message(planned.test.name().to_string());
            match self.run_test(planned, &mut target_queue, &mut oracle_queue, &mut device).await {
                Ok(dumps) => {
                    info!(test = planned.test.name(), dumps, "Test passed");
                    summary.passed.push(planned.test.name().to_string());
                    progress.inc(1);
                }
                Err(e) => {
                    warn!(test = planned.test.name(), "Test failed: {e}");
                    outcome = Err(e);
                    break;
                }
            }
        }

        target_builds.abort();
        oracle_builds.abort();
        if let Some(device) = device.take() {
            self.shutdown_device(device).await;
        }
        progress.finish_and_clear();
        outcome.map(|()| summary)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar
    }

    fn boot(&self) -> TargetBoot {
        TargetBoot {
            entry: self.config.target.entry.clone(),
            stack_pointer: self.config.target.stack_pointer,
            verify_upload: self.config.target.verify_upload,
        }
    }

    async fn run_test(
        &self,
        planned: &PlannedTest,
        target_queue: &mut mpsc::Receiver<C2tResult<Artifact>>,
        oracle_queue: &mut mpsc::Receiver<C2tResult<Artifact>>,
        device: &mut Option<Device>,
    ) -> C2tResult<usize> {
        let name = planned.test.name();
        let timeouts = &self.config.timeouts;
        let target_artifact =
            next_artifact(target_queue, &self.config.target.machine.arch, &planned.test).await?;
        let oracle_artifact =
            next_artifact(oracle_queue, &self.config.oracle.machine.arch, &planned.test).await?;
        let target_image = self.loader.load(&target_artifact)?;
        let oracle_image = self.loader.load(&oracle_artifact)?;

        let port = free_ports(1)?[0];
        let bin = oracle_artifact.path.display().to_string();
        let command = render(&self.config.oracle.stub, &[("port", &port.to_string()), ("bin", &bin)]);
        let mut stub = self.supervisor.spawn(&format!("{name}_oracle"), &command)?;
        let stream = connect_with_retry("debug stub", port, Some(&mut stub), timeouts).await?;
        let mut oracle = DebugSession::connect(
            SessionKind::Oracle,
            self.oracle_layout.clone(),
            self.config.oracle.machine.observe.clone(),
            stream,
            timeouts,
        )
        .await?;
        oracle.load(&oracle_artifact, oracle_image, &planned.specs).await?;

        let mut target = self.target_session(device).await?;
        target.load(&target_artifact, target_image, &planned.specs).await?;

        let (oracle_tx, mut oracle_dumps) = mpsc::channel(DUMP_QUEUE);
        let (target_tx, mut target_dumps) = mpsc::channel(DUMP_QUEUE);
        let oracle_task = tokio::spawn(async move {
            let result = oracle.run(&oracle_tx).await;
            (oracle, result)
        });
        let target_task = tokio::spawn(async move {
            let result = target.run(&target_tx).await;
            (target, result)
        });
        let comparison = compare(name, &mut oracle_dumps, &mut target_dumps).await;
        drop(oracle_dumps);
        drop(target_dumps);
        let (mut oracle, oracle_run) = oracle_task.await.map_err(task_failed)?;
        let (mut target, target_run) = target_task.await.map_err(task_failed)?;

        if let Err(e) = oracle.finish(true).await {
            debug!(test = name, error = %e, "Oracle teardown failed");
        }
        drop(oracle);
        stub.terminate(timeouts.shutdown(), self.options.kill).await;

        // Session failures explain a broken stream better than the comparator can
        oracle_run?;
        target_run?;
        let dumps = comparison?.into_result()?;

        match self.mode {
            RunMode::Reuse => {
                target.finish(false).await?;
                if let Some(device) = device.as_mut() {
                    device.session = Some(target);
                }
            }
            RunMode::Relaunch => {
                if let Err(e) = target.finish(true).await {
                    debug!(test = name, error = %e, "Target teardown failed");
                }
                drop(target);
                if let Some(device) = device.take() {
                    self.shutdown_device(device).await;
                }
            }
        }
        Ok(dumps)
    }

    /// A target session ready to load the next program.
    async fn target_session(&self, device: &mut Option<Device>) -> C2tResult<DebugSession> {
        if self.mode == RunMode::Reuse {
            if let Some(existing) = device.as_mut() {
                let monitor = existing.monitor.as_mut().ok_or_else(|| {
                    C2tError::Config("reuse mode needs the emulator's control port".into())
                })?;
                monitor.stop().await?;
                monitor.system_reset().await?;
                let mut session = existing
                    .session
                    .take()
                    .ok_or_else(|| C2tError::protocol("emulator has no debug session"))?;
                let stream = connect_with_retry(
                    "emulator",
                    existing.port,
                    Some(&mut existing.emulator),
                    &self.config.timeouts,
                )
                .await?;
                session.reattach(stream).await?;
                return Ok(session);
            }
        } else if let Some(stale) = device.take() {
            self.shutdown_device(stale).await;
        }

        let launched = device.insert(self.launch_device().await?);
        launched.session.take().ok_or_else(|| C2tError::protocol("emulator has no debug session"))
    }

    async fn launch_device(&self) -> C2tResult<Device> {
        let timeouts = &self.config.timeouts;
        let ports = free_ports(2)?;
        let (port, control_port) = (ports[0], ports[1]);
        let command = render(
            &self.config.target.emulator,
            &[("port", &port.to_string()), ("control_port", &control_port.to_string())],
        );
        let mut emulator = self.supervisor.spawn("emulator", &command)?;

        let monitor = if self.config.target.emulator.contains("{control_port}") {
            let stream =
                connect_with_retry("emulator console", control_port, Some(&mut emulator), timeouts)
                    .await?;
            Some(MonitorClient::connect(stream, timeouts.reply()).await?)
        } else {
            None
        };
        let stream = connect_with_retry("emulator", port, Some(&mut emulator), timeouts).await?;
        let session = DebugSession::connect(
            SessionKind::Target(self.boot()),
            self.target_layout.clone(),
            self.config.target.machine.observe.clone(),
            stream,
            timeouts,
        )
        .await?;
        Ok(Device { emulator, port, monitor, session: Some(session) })
    }

    async fn shutdown_device(&self, mut device: Device) {
        if let Some(mut session) = device.session.take() {
            // A finished session already released the device
            if !matches!(session.state(), SessionState::Idle | SessionState::Finished) {
                if let Err(e) = session.finish(true).await {
                    debug!(error = %e, "Target teardown failed");
                }
            }
        }
        if !self.options.kill {
            if let Some(monitor) = device.monitor.take() {
                if let Err(e) = monitor.quit().await {
                    debug!(error = %e, "Emulator console did not take `quit`");
                }
            }
        }
        device.emulator.terminate(self.config.timeouts.shutdown(), self.options.kill).await;
    }
}

async fn next_artifact(
    queue: &mut mpsc::Receiver<C2tResult<Artifact>>,
    arch: &Arch,
    test: &TestCase,
) -> C2tResult<Artifact> {
    let artifact = queue.recv().await.ok_or_else(|| {
        C2tError::protocol(format!("{arch} builder stopped before building {test}"))
    })??;
    if artifact.test != *test {
        return Err(C2tError::protocol(format!(
            "{arch} builder delivered {} while {test} was expected",
            artifact.test
        )));
    }
    Ok(artifact)
}

fn task_failed(err: tokio::task::JoinError) -> C2tError {
    C2tError::protocol(format!("session task failed: {err}"))
}
