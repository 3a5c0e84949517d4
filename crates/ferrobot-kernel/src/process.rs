//! [`ProcessManager`] – supervises the external processes declared next to
//! the resources.
//!
//! One-shot processes run to completion while the configuration is applied.
//! Long-running processes are spawned and kept until they are removed,
//! modified (killed and restarted with the new declaration) or the manager
//! is stopped. Children are spawned with `kill_on_drop`, so none outlive
//! the manager.

use std::collections::HashMap;
use std::process::Stdio;

use ferrobot_types::{ProcessConfig, RobotError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::diff::Partition;

struct ManagedProcess {
    config: ProcessConfig,
    child: Child,
    log_tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
pub struct ProcessManager {
    running: Mutex<HashMap<String, ManagedProcess>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the process part of a config diff.
    ///
    /// Failures are logged and returned; none of them stops the rest of the
    /// diff from being applied.
    pub async fn apply(&self, diff: &Partition<ProcessConfig>) -> Vec<RobotError> {
        let mut errors = Vec::new();
        for cfg in diff.removed.iter().chain(&diff.modified) {
            if let Err(e) = self.stop_process(&cfg.id).await {
                warn!(process = %cfg.id, error = %e, "failed to stop process");
                errors.push(e);
            }
        }
        for cfg in diff.modified.iter().chain(&diff.added) {
            if let Err(e) = self.start(cfg).await {
                warn!(process = %cfg.id, error = %e, "failed to start process");
                errors.push(e);
            }
        }
        errors
    }

    /// Start one declared process. One-shot processes are awaited.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Process`] when the process cannot be spawned or
    /// a one-shot process exits unsuccessfully.
    pub async fn start(&self, cfg: &ProcessConfig) -> Result<(), RobotError> {
        let mut cmd = Command::new(&cfg.name);
        cmd.args(&cfg.args).kill_on_drop(true).stdin(Stdio::null());
        if let Some(cwd) = &cfg.cwd {
            cmd.current_dir(cwd);
        }
        if cfg.log {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(|e| process_error(&cfg.id, e))?;
        let log_tasks = forward_output(&cfg.id, &mut child);

        if cfg.one_shot {
            let status = child.wait().await.map_err(|e| process_error(&cfg.id, e))?;
            for task in log_tasks {
                let _ = task.await;
            }
            if !status.success() {
                return Err(process_error(&cfg.id, format!("exited with {status}")));
            }
            info!(process = %cfg.id, "one-shot process finished");
            return Ok(());
        }

        info!(process = %cfg.id, pid = child.id(), "process started");
        let previous = self.running.lock().await.insert(
            cfg.id.clone(),
            ManagedProcess {
                config: cfg.clone(),
                child,
                log_tasks,
            },
        );
        if let Some(previous) = previous {
            terminate(&cfg.id, previous).await?;
        }
        Ok(())
    }

    /// Kill the process registered under `id`. Unknown ids are ignored.
    pub async fn stop_process(&self, id: &str) -> Result<(), RobotError> {
        let entry = self.running.lock().await.remove(id);
        match entry {
            Some(process) => terminate(id, process).await,
            None => Ok(()),
        }
    }

    /// Kill every running process.
    ///
    /// # Errors
    ///
    /// Returns every kill failure, combined.
    pub async fn stop(&self) -> Result<(), RobotError> {
        let drained: Vec<(String, ManagedProcess)> = self.running.lock().await.drain().collect();
        let mut errors = Vec::new();
        for (id, process) in drained {
            if let Err(e) = terminate(&id, process).await {
                errors.push(e);
            }
        }
        RobotError::combine(errors).map_or(Ok(()), Err)
    }

    /// Ids of the long-running processes currently supervised.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True while the process registered under `id` has not exited.
    pub async fn is_running(&self, id: &str) -> bool {
        let mut running = self.running.lock().await;
        match running.get_mut(id) {
            Some(process) => matches!(process.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub async fn config(&self, id: &str) -> Option<ProcessConfig> {
        self.running.lock().await.get(id).map(|p| p.config.clone())
    }
}

async fn terminate(id: &str, mut process: ManagedProcess) -> Result<(), RobotError> {
    if let Ok(Some(status)) = process.child.try_wait() {
        debug!(process = %id, %status, "process had already exited");
    } else {
        process.child.kill().await.map_err(|e| process_error(id, e))?;
        info!(process = %id, "process stopped");
    }
    for task in process.log_tasks {
        task.abort();
    }
    Ok(())
}

fn forward_output(id: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        tasks.push(spawn_log_reader(id.to_string(), "stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
        tasks.push(spawn_log_reader(id.to_string(), "stderr", stderr));
    }
    tasks
}

fn spawn_log_reader<R>(id: String, stream: &'static str, reader: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(process = %id, stream, "{line}");
        }
    })
}

fn process_error(id: &str, reason: impl std::fmt::Display) -> RobotError {
    RobotError::Process {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}
