//! The workflow runner.

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use weircore::{Process, WeirError, WorkflowError};

/// Owns an ordered collection of processes plus a designated sink.
///
/// `run` starts every non-sink process concurrently, then runs the sink
/// inline so the caller blocks until all data has drained through it.
/// Channel closures propagate from the sources through every connected
/// port, which is the only coordination the processes need.
pub struct Workflow {
    name: String,
    processes: Vec<Box<dyn Process>>,
    sink: Option<Box<dyn Process>>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processes: Vec::new(),
            sink: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a process to be started when the workflow runs.
    pub fn add_process(&mut self, process: Box<dyn Process>) {
        self.processes.push(process);
    }

    /// Designate the terminal process the workflow blocks on.
    pub fn set_sink(&mut self, sink: Box<dyn Process>) {
        self.sink = Some(sink);
    }

    /// Run the workflow to completion, consuming its processes.
    ///
    /// Fails fast if any process reports unwired ports; otherwise the first
    /// process failure (source errors before cascade errors) is surfaced
    /// after the sink returns.
    pub async fn run(&mut self) -> Result<(), WeirError> {
        let mut sink = self.sink.take().ok_or(WorkflowError::NoSink)?;
        for process in &self.processes {
            if !process.is_connected() {
                return Err(WorkflowError::Unconnected(process.name().to_string()).into());
            }
        }
        if !sink.is_connected() {
            return Err(WorkflowError::Unconnected(sink.name().to_string()).into());
        }

        info!(workflow = %self.name, processes = self.processes.len(), "starting workflow");
        let mut handles: Vec<JoinHandle<(String, Result<(), WeirError>)>> = Vec::new();
        for mut process in self.processes.drain(..) {
            handles.push(tokio::spawn(async move {
                let name = process.name().to_string();
                let result = process.run().await;
                (name, result)
            }));
        }

        debug!(workflow = %self.name, sink = %sink.name(), "running sink inline");
        let sink_result = sink.run().await;

        let mut first_err: Option<WeirError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok((name, Ok(()))) => debug!(process = %name, "process completed"),
                Ok((name, Err(e))) => {
                    error!(process = %name, error = %e, "process failed");
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "process task failed to join");
                    first_err.get_or_insert(WorkflowError::Join(e.to_string()).into());
                }
            }
        }
        if let Err(e) = sink_result {
            error!(workflow = %self.name, error = %e, "sink failed");
            first_err.get_or_insert(e);
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                info!(workflow = %self.name, "workflow finished");
                Ok(())
            }
        }
    }
}
