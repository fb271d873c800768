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

//! Test builders.
//!
//! A [`Builder`] turns test sources into executables for one architecture by
//! running the stages of a [`BuildPipeline`] as shell commands. Builds run in
//! a background task that stays at most one test ahead of the consumer.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use c2t_common::{Arch, Artifact, TestCase};
use tokio::{process::Command, sync::mpsc, task::JoinHandle};
use tracing::{debug, info};

use crate::{
    config::{render, BuildPipeline},
    orchestrator::GroupGuard,
    C2tError, C2tResult,
};

/// Capacity of the hand-off queue. A slot is reserved before a build starts,
/// so built-but-unconsumed artifacts never exceed this.
pub const READ_AHEAD: usize = 2;

/// Builds tests for one architecture.
#[derive(Debug, Clone)]
pub struct Builder {
    arch: Arch,
    pipeline: BuildPipeline,
    out_dir: PathBuf,
    extension: String,
}

impl Builder {
    /// Builder writing into `work_dir/<arch>/`.
    pub fn new(arch: Arch, pipeline: BuildPipeline, work_dir: &Path) -> Self {
        let out_dir = work_dir.join(arch.as_str());
        let extension = pipeline.binary_extension();
        Self { arch, pipeline, out_dir, extension }
    }

    /// Architecture built for.
    pub fn arch(&self) -> &Arch {
        &self.arch
    }

    /// Directory receiving IR and binaries.
    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Path of the executable `test` builds to.
    pub fn artifact_path(&self, test: &TestCase) -> PathBuf {
        self.out_dir.join(format!("{}{}", test.binary_name(&self.arch), self.extension))
    }

    /// Run every stage for `test`, in order, stopping at the first failure.
    pub async fn build(&self, test: &TestCase) -> C2tResult<Artifact> {
        tokio::fs::create_dir_all(&self.out_dir).await?;
        let src = test.source().display().to_string();
        let ir = self.out_dir.join(test.ir_name(&self.arch)).display().to_string();
        let bin = self.out_dir.join(test.binary_name(&self.arch)).display().to_string();
        let vars = [("src", src.as_str()), ("ir", ir.as_str()), ("bin", bin.as_str())];

        info!(test = test.name(), arch = %self.arch, "Building test");
        for stage in self.pipeline.stages() {
            let command = render(&stage.template, &vars);
            debug!(test = test.name(), arch = %self.arch, stage = stage.name, %command, "Running build stage");
            let child = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .process_group(0)
                .kill_on_drop(true)
                .spawn()?;
            // Compilers fork; an aborted build must take the whole stage down
            let _stage = GroupGuard::new(child.id());
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(C2tError::Build {
                    test: test.name().to_string(),
                    arch: self.arch.clone(),
                    stage: stage.name.to_string(),
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }

        let path = self.artifact_path(test);
        if !tokio::fs::try_exists(&path).await? {
            return Err(C2tError::Build {
                test: test.name().to_string(),
                arch: self.arch.clone(),
                stage: "output".into(),
                status: "missing".into(),
                stderr: format!("the pipeline finished but {} does not exist", path.display()),
            });
        }
        debug!(test = test.name(), arch = %self.arch, path = %path.display(), "Build finished");
        Ok(Artifact { test: test.clone(), arch: self.arch.clone(), path })
    }

    /// Build `tests` in order in a background task.
    ///
    /// Artifacts arrive on the returned queue in test order. The task stops
    /// after the first failed build (which is delivered as an error) or when
    /// the receiver is dropped.
    pub fn spawn(self, tests: Vec<TestCase>) -> (mpsc::Receiver<C2tResult<Artifact>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(READ_AHEAD);
        let handle = tokio::spawn(async move {
            for test in tests {
                let Ok(permit) = tx.reserve().await else {
                    debug!(arch = %self.arch, "Artifact consumer is gone, stopping builds");
                    return;
                };
                let result = self.build(&test).await;
                let failed = result.is_err();
                permit.send(result);
                if failed {
                    return;
                }
            }
        });
        (rx, handle)
    }
}
