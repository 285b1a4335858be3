//! Shell tasks: one materialized command execution each.
//!
//! A task is built per gather iteration of its owning process: output
//! packets are constructed from the registered path formatters, the command
//! template is formatted against the full tuple, and the task then executes
//! once and signals done exactly once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use weircore::{format_command, Ip, TaskError, WeirError};

/// Strategy run in place of the shell command, for processes whose work is
/// done in-process.
pub type CustomExecute = Arc<dyn Fn(&ShellTask) -> Result<(), TaskError> + Send + Sync>;

/// Produces the final output path for one output port, given the task's
/// inputs and parameters.
pub type PathFormatter = Arc<dyn Fn(&ShellTask) -> Result<String, TaskError> + Send + Sync>;

/// One concrete execution of a process's command for one tuple of inputs
/// and parameters.
pub struct ShellTask {
    /// Input packets keyed by port name.
    pub in_ips: HashMap<String, Ip>,
    /// Freshly constructed output packets keyed by port name.
    pub out_ips: HashMap<String, Ip>,
    /// Parameter values keyed by port name.
    pub params: HashMap<String, String>,
    /// The fully formatted command string.
    pub command: String,
    process: String,
    custom_execute: Option<CustomExecute>,
}

impl ShellTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        process: &str,
        pattern: &str,
        in_ips: HashMap<String, Ip>,
        formatters: &HashMap<String, PathFormatter>,
        streaming_outputs: &HashSet<String>,
        params: HashMap<String, String>,
        prepend: &str,
        custom_execute: Option<CustomExecute>,
    ) -> Result<Self, WeirError> {
        let mut task = Self {
            in_ips,
            out_ips: HashMap::new(),
            params,
            command: String::new(),
            process: process.to_string(),
            custom_execute,
        };
        let mut out_ips = HashMap::new();
        for (name, formatter) in formatters {
            let path = formatter(&task)?;
            debug!(process, port = %name, %path, "creating output packet");
            let ip = if streaming_outputs.contains(name) {
                Ip::streaming(path)
            } else {
                Ip::new(path)
            };
            out_ips.insert(name.clone(), ip);
        }
        task.out_ips = out_ips;
        task.command = format_command(pattern, &task.in_ips, &task.out_ips, &task.params, prepend)?;
        debug!(process, command = %task.command, "created formatted command");
        Ok(task)
    }

    /// Final path of the incoming packet on `port`.
    pub fn in_path(&self, port: &str) -> Result<&str, TaskError> {
        self.in_ips
            .get(port)
            .map(|ip| ip.path())
            .ok_or_else(|| TaskError::MissingInputPath {
                port: port.to_string(),
            })
    }

    /// Value of the parameter on `port`, if the task carries one.
    pub fn param(&self, port: &str) -> Option<&str> {
        self.params.get(port).map(String::as_str)
    }

    /// Whether any non-streaming output already exists at its final or temp
    /// path. Each offender gets a warning; an existing output means the
    /// task must not run again.
    pub(crate) async fn any_output_exists(&self) -> bool {
        let mut any = false;
        for ip in self.out_ips.values() {
            if ip.is_streaming() {
                continue;
            }
            if ip.exists().await {
                warn!(
                    process = %self.process,
                    path = %ip.path(),
                    "output file already exists; check your workflow for correctness"
                );
                any = true;
            }
            if ip.temp_exists().await {
                warn!(
                    process = %self.process,
                    path = %ip.temp_path(),
                    "temporary output file already exists; check your workflow for correctness"
                );
                any = true;
            }
        }
        any
    }

    /// Whether any streaming output's FIFO is already on disk, meaning a
    /// concurrent participant created it and owns this execution.
    pub(crate) async fn any_fifos_exist(&self) -> bool {
        let mut any = false;
        for ip in self.out_ips.values() {
            if ip.is_streaming() && ip.fifo_exists().await {
                warn!(
                    process = %self.process,
                    path = %ip.fifo_path(),
                    "output FIFO already exists; treating as a hand-off"
                );
                any = true;
            }
        }
        any
    }

    /// Whether any streaming output's FIFO is missing from disk.
    pub(crate) async fn fifos_missing(&self) -> bool {
        let mut missing = false;
        for ip in self.out_ips.values() {
            if ip.is_streaming() && !ip.fifo_exists().await {
                warn!(
                    process = %self.process,
                    path = %ip.fifo_path(),
                    "FIFO missing for streaming output; check your workflow for correctness"
                );
                missing = true;
            }
        }
        missing
    }

    /// Create the named pipe for every streaming output.
    pub(crate) async fn create_fifos(&self) -> Result<(), WeirError> {
        for ip in self.out_ips.values() {
            if ip.is_streaming() {
                ip.create_fifo().await?;
            }
        }
        Ok(())
    }

    /// Run the task to completion, then signal done.
    ///
    /// The sentinel is sent on every path out of here, including skips and
    /// failures, so the ordering stage always observes exactly one
    /// completion per task.
    pub(crate) async fn execute(self, done: oneshot::Sender<()>) -> Result<(), WeirError> {
        let result = self.execute_inner().await;
        let _ = done.send(());
        result
    }

    async fn execute_inner(&self) -> Result<(), WeirError> {
        if self.any_output_exists().await {
            warn!(
                process = %self.process,
                command = %self.command,
                "outputs already exist, not executing"
            );
            return Ok(());
        }
        if self.fifos_missing().await {
            warn!(
                process = %self.process,
                command = %self.command,
                "streaming FIFOs missing, not executing"
            );
            return Ok(());
        }
        if let Some(custom) = &self.custom_execute {
            debug!(process = %self.process, command = %self.command, "running custom executor");
            custom(self)?;
        } else {
            self.run_command().await?;
        }
        self.atomize_outputs().await
    }

    async fn run_command(&self) -> Result<(), WeirError> {
        info!(process = %self.process, command = %self.command, "executing command");
        let output = Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .output()
            .await
            .map_err(|e| TaskError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;
        if !output.status.success() {
            return Err(TaskError::Command {
                command: self.command.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Commit every non-streaming output; a streaming output's FIFO was the
    /// real artifact and is left alone.
    async fn atomize_outputs(&self) -> Result<(), WeirError> {
        for ip in self.out_ips.values() {
            if ip.is_streaming() {
                debug!(path = %ip.path(), "output is streaming, not atomizing");
            } else {
                ip.atomize().await?;
            }
        }
        Ok(())
    }
}
