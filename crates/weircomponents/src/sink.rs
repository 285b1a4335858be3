use async_trait::async_trait;
use tracing::debug;
use weircore::{FilePort, Process, WeirError};

/// Terminal process that drains its input port until every upstream closes.
///
/// A workflow blocks on its sink, so hanging one off the final outputs is
/// what drives the whole graph.
pub struct Sink {
    name: String,
    pub in_port: FilePort,
}

impl Sink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_port: FilePort::new(),
        }
    }
}

#[async_trait]
impl Process for Sink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.in_port.is_connected()
    }

    async fn run(&mut self) -> Result<(), WeirError> {
        self.in_port.start_merger();
        while let Some(ip) = self.in_port.recv().await {
            debug!(process = %self.name, path = %ip.path(), "sink received packet");
        }
        Ok(())
    }
}
