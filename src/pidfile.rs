// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// PID file bookkeeping for the `serve`, `status` and `stop` commands

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    NotRunning,
    Running(u32),
    /// The file names a process that no longer exists
    Stale(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    /// Exited after this many termination signals
    Terminated { attempts: u32 },
    /// Still alive after every attempt and was killed
    Killed,
}

pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the current process. Fails if a live process already owns the file.
    pub fn write(&self) -> Result<u32> {
        if let ProcessStatus::Running(pid) = self.status()? {
            bail!(
                "Store already running with pid {} ({})",
                pid,
                self.path.display()
            );
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let pid = std::process::id();
        std::fs::write(&self.path, format!("{}\n", pid))
            .with_context(|| format!("Failed to write pid file {}", self.path.display()))?;
        Ok(pid)
    }

    pub fn read(&self) -> Result<Option<u32>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let pid = contents
            .trim()
            .parse::<u32>()
            .with_context(|| format!("Malformed pid file {}", self.path.display()))?;
        Ok(Some(pid))
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }

    pub fn status(&self) -> Result<ProcessStatus> {
        Ok(match self.read()? {
            None => ProcessStatus::NotRunning,
            Some(pid) if is_alive(pid) => ProcessStatus::Running(pid),
            Some(pid) => ProcessStatus::Stale(pid),
        })
    }
}

pub fn is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

async fn signal(pid: u32, name: &str) -> Result<()> {
    let status = Command::new("kill")
        .arg(format!("-{}", name))
        .arg(pid.to_string())
        .status()
        .await
        .context("Failed to run kill")?;
    if !status.success() && is_alive(pid) {
        bail!("kill -{} {} exited with {}", name, pid, status);
    }
    Ok(())
}

/// Ask `pid` to terminate up to `attempts` times, `interval` apart, then
/// kill it outright.
pub async fn stop_process(pid: u32, attempts: u32, interval: Duration) -> Result<StopResult> {
    for attempt in 1..=attempts {
        if !is_alive(pid) {
            return Ok(StopResult::Terminated { attempts: attempt - 1 });
        }
        info!("Sending SIGTERM to {} (attempt {}/{})", pid, attempt, attempts);
        signal(pid, "TERM").await?;
        sleep(interval).await;
        if !is_alive(pid) {
            return Ok(StopResult::Terminated { attempts: attempt });
        }
    }

    warn!("Process {} ignored {} termination requests; killing", pid, attempts);
    signal(pid, "KILL").await?;
    Ok(StopResult::Killed)
}
