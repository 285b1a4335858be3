//! Shell processes: command templates bound to ports.
//!
//! A `ShellProcess` parses its command template for `{kind:name}`
//! placeholders and grows one port per distinct name. Its run loop gathers
//! one packet per input port and one value per parameter port, builds a
//! task for the tuple, schedules it, and forwards outputs: streaming
//! outputs immediately, everything else in task creation order once the
//! producing command has finished.

use crate::task::{CustomExecute, PathFormatter, ShellTask};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use weircore::{
    expand_params, parse_placeholders, EngineConfig, FilePort, Ip, ParamPort, PortError, Process,
    TaskError, WeirError, WorkflowError,
};

/// A workflow process wrapping one shell command template.
pub struct ShellProcess {
    name: String,
    command_pattern: String,
    config: EngineConfig,
    in_ports: HashMap<String, FilePort>,
    out_ports: HashMap<String, FilePort>,
    streaming_outputs: HashSet<String>,
    path_formatters: HashMap<String, PathFormatter>,
    param_ports: HashMap<String, ParamPort>,
    custom_execute: Option<CustomExecute>,
    prepend: String,
}

/// A scheduled task awaiting ordered emission: its output packets, the
/// completion signal, the execution handle when this process ran it, and
/// whether this process created its FIFOs (and so owns their removal).
struct ScheduledTask {
    out_ips: HashMap<String, Ip>,
    done: oneshot::Receiver<()>,
    handle: Option<JoinHandle<Result<(), WeirError>>>,
    created_fifos: bool,
}

impl ShellProcess {
    /// Process named `name` around `command`, with default configuration.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self::with_config(name, command, EngineConfig::default())
    }

    /// Process with an explicit engine configuration (channel capacities).
    pub fn with_config(
        name: impl Into<String>,
        command: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        let mut process = Self {
            name: name.into(),
            command_pattern: command.into(),
            config,
            in_ports: HashMap::new(),
            out_ports: HashMap::new(),
            streaming_outputs: HashSet::new(),
            path_formatters: HashMap::new(),
            param_ports: HashMap::new(),
            custom_execute: None,
            prepend: String::new(),
        };
        process.init_ports_from_pattern();
        process
    }

    /// Process whose `{p:name}` placeholders with a value in `params` are
    /// expanded to literals at construction; no port is declared for them.
    pub fn with_literal_params(
        name: impl Into<String>,
        command: &str,
        params: &HashMap<String, String>,
    ) -> Self {
        Self::with_config(name, expand_params(command, params), EngineConfig::default())
    }

    /// Declare one port per distinct placeholder name in the template.
    fn init_ports_from_pattern(&mut self) {
        let capacity = self.config.buf_size;
        for placeholder in parse_placeholders(&self.command_pattern) {
            if placeholder.kind.is_output() {
                if placeholder.kind == weircore::PlaceholderKind::StreamingOutput {
                    self.streaming_outputs.insert(placeholder.name.clone());
                }
                self.out_ports
                    .entry(placeholder.name)
                    .or_insert_with(|| FilePort::with_capacity(capacity));
            } else if placeholder.kind.is_input() {
                self.in_ports
                    .entry(placeholder.name)
                    .or_insert_with(|| FilePort::with_capacity(capacity));
            } else {
                self.param_ports
                    .entry(placeholder.name)
                    .or_insert_with(|| ParamPort::with_capacity(capacity));
            }
        }
    }

    /// The command template this process was declared with.
    pub fn command_pattern(&self) -> &str {
        &self.command_pattern
    }

    /// Input port `name`, for wiring.
    pub fn in_port(&mut self, name: &str) -> Result<&mut FilePort, PortError> {
        self.in_ports
            .get_mut(name)
            .ok_or_else(|| PortError::UnknownInPort(name.to_string()))
    }

    /// Output port `name`, for wiring.
    pub fn out_port(&mut self, name: &str) -> Result<&mut FilePort, PortError> {
        self.out_ports
            .get_mut(name)
            .ok_or_else(|| PortError::UnknownOutPort(name.to_string()))
    }

    /// Parameter port `name`, for wiring.
    pub fn param_port(&mut self, name: &str) -> Result<&mut ParamPort, PortError> {
        self.param_ports
            .get_mut(name)
            .ok_or_else(|| PortError::UnknownParamPort(name.to_string()))
    }

    /// Register an arbitrary path formatter for `out_port`.
    pub fn set_path_formatter(
        &mut self,
        out_port: &str,
        formatter: impl Fn(&ShellTask) -> Result<String, TaskError> + Send + Sync + 'static,
    ) {
        self.path_formatters
            .insert(out_port.to_string(), Arc::new(formatter));
    }

    /// Output path is a fixed string.
    pub fn set_path_static(&mut self, out_port: &str, path: &str) {
        let path = path.to_string();
        self.set_path_formatter(out_port, move |_| Ok(path.clone()));
    }

    /// Output path extends the packet arriving on `in_port` with a suffix.
    pub fn set_path_extend(&mut self, out_port: &str, in_port: &str, extension: &str) {
        let in_port = in_port.to_string();
        let extension = extension.to_string();
        self.set_path_formatter(out_port, move |task| {
            Ok(format!("{}{}", task.in_path(&in_port)?, extension))
        });
    }

    /// Output path substitutes `old` with `new` in the path of the packet
    /// arriving on `in_port`.
    pub fn set_path_replace(&mut self, out_port: &str, in_port: &str, old: &str, new: &str) {
        let in_port = in_port.to_string();
        let old = old.to_string();
        let new = new.to_string();
        self.set_path_formatter(out_port, move |task| {
            Ok(task.in_path(&in_port)?.replace(&old, &new))
        });
    }

    /// Run this strategy instead of spawning the shell command.
    pub fn set_custom_execute(
        &mut self,
        execute: impl Fn(&ShellTask) -> Result<(), TaskError> + Send + Sync + 'static,
    ) {
        self.custom_execute = Some(Arc::new(execute));
    }

    /// Prefix the formatted command with a wrapper such as `time`.
    pub fn set_prepend(&mut self, prepend: impl Into<String>) {
        self.prepend = prepend.into();
    }

    /// Gather one packet per input port. Returns the packets and whether
    /// every input port was still open; a closed port flips the flag and is
    /// skipped for the rest of the iteration.
    async fn receive_inputs(&mut self) -> (HashMap<String, Ip>, bool) {
        let mut open = true;
        let mut in_ips = HashMap::new();
        for (name, port) in self.in_ports.iter_mut() {
            debug!(process = %self.name, port = %name, "receiving on input port");
            match port.recv().await {
                Some(ip) => {
                    debug!(process = %self.name, port = %name, path = %ip.path(), "got input packet");
                    in_ips.insert(name.clone(), ip);
                }
                None => open = false,
            }
        }
        (in_ips, open)
    }

    /// Gather one value per parameter port, tracking closure like
    /// `receive_inputs`.
    async fn receive_params(&self) -> (HashMap<String, String>, bool) {
        let mut open = true;
        let mut params = HashMap::new();
        for (name, port) in self.param_ports.iter() {
            match port.recv().await {
                Some(value) => {
                    debug!(process = %self.name, port = %name, %value, "got parameter");
                    params.insert(name.clone(), value);
                }
                None => open = false,
            }
        }
        (params, open)
    }

    fn out_port_ref(&self, name: &str) -> Result<&FilePort, PortError> {
        self.out_ports
            .get(name)
            .ok_or_else(|| PortError::UnknownOutPort(name.to_string()))
    }

    async fn run_inner(&mut self) -> Result<(), WeirError> {
        for port in self.in_ports.values_mut() {
            port.start_merger();
        }

        debug!(process = %self.name, command = %self.command_pattern, "starting to create and schedule tasks");
        let mut scheduled: Vec<ScheduledTask> = Vec::new();
        loop {
            let (in_ips, in_open) = self.receive_inputs().await;
            let (params, params_open) = self.receive_params().await;

            if !in_open && !params_open {
                debug!(process = %self.name, "both input and parameter ports closed, stopping");
                break;
            }
            if self.in_ports.is_empty() && !params_open {
                debug!(process = %self.name, "no input ports and parameters closed, stopping");
                break;
            }
            if self.param_ports.is_empty() && !in_open {
                debug!(process = %self.name, "no parameter ports and inputs closed, stopping");
                break;
            }
            if !in_open || !params_open {
                // Mixed process with one side closed: the tuple is
                // incomplete, so no further task can be formed. Remaining
                // buffered traffic on the other side is dropped.
                debug!(process = %self.name, "one side closed with the other still open, stopping");
                break;
            }

            let task = ShellTask::new(
                &self.name,
                &self.command_pattern,
                in_ips,
                &self.path_formatters,
                &self.streaming_outputs,
                params,
                &self.prepend,
                self.custom_execute.clone(),
            )?;

            // A pre-existing FIFO means a concurrent participant created it
            // and owns the execution; skip creation and hand off.
            let fifos_exist = task.any_fifos_exist().await;
            if !fifos_exist {
                task.create_fifos().await?;
            }

            // Streaming outputs go downstream before the command finishes,
            // so consumers can open the FIFO while the producer writes.
            for (name, ip) in &task.out_ips {
                if ip.is_streaming() {
                    debug!(process = %self.name, port = %name, "sending streaming output before execution");
                    self.out_port_ref(name)?.send(ip.clone()).await?;
                }
            }

            let (done_tx, done_rx) = oneshot::channel();
            let out_ips = task.out_ips.clone();
            let handle = if fifos_exist {
                let _ = done_tx.send(());
                None
            } else {
                debug!(process = %self.name, command = %task.command, "firing off task");
                Some(tokio::spawn(task.execute(done_tx)))
            };
            scheduled.push(ScheduledTask {
                out_ips,
                done: done_rx,
                handle,
                created_fifos: !fifos_exist,
            });

            if self.in_ports.is_empty() && self.param_ports.is_empty() {
                debug!(process = %self.name, "no input or parameter ports, single-shot process done");
                break;
            }
        }

        debug!(process = %self.name, tasks = scheduled.len(), "waiting for tasks, sending outputs in creation order");
        for task in scheduled {
            let _ = task.done.await;
            if let Some(handle) = task.handle {
                handle
                    .await
                    .map_err(|e| WorkflowError::Join(e.to_string()))??;
            }
            for (name, ip) in &task.out_ips {
                if ip.is_streaming() {
                    if task.created_fifos {
                        ip.remove_fifo().await?;
                    }
                } else {
                    debug!(process = %self.name, port = %name, path = %ip.path(), "sending output");
                    self.out_port_ref(name)?.send(ip.clone()).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Process for ShellProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.in_ports.values().all(FilePort::is_connected)
            && self.out_ports.values().all(FilePort::is_connected)
            && self.param_ports.values().all(ParamPort::is_connected)
    }

    async fn run(&mut self) -> Result<(), WeirError> {
        let result = self.run_inner().await;
        for port in self.out_ports.values_mut() {
            port.close();
        }
        result
    }
}
