use async_trait::async_trait;
use tracing::debug;
use weircore::{FilePort, Ip, Process, WeirError};

/// Emits one freshly constructed information packet per configured file
/// path, then closes its out port.
pub struct IpSource {
    name: String,
    pub out: FilePort,
    paths: Vec<String>,
}

impl IpSource {
    pub fn new<I, S>(name: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            out: FilePort::new(),
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Process for IpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.out.is_connected()
    }

    async fn run(&mut self) -> Result<(), WeirError> {
        for path in &self.paths {
            debug!(process = %self.name, %path, "emitting packet");
            self.out.send(Ip::new(path.clone())).await?;
        }
        self.out.close();
        Ok(())
    }
}
