use crate::WeirError;
use async_trait::async_trait;

/// Core trait that all workflow processes implement
///
/// A process owns its ports. `run` blocks until every port has drained and
/// must close every output port it owns before returning, so that closure
/// cascades to downstream processes.
#[async_trait]
pub trait Process: Send {
    /// Human-readable process name, used in logs and errors
    fn name(&self) -> &str;

    /// Whether every port on this process has been wired to a peer
    fn is_connected(&self) -> bool;

    /// Drive the process until its inputs close
    async fn run(&mut self) -> Result<(), WeirError>;
}
