/// Default capacity for every port channel.
pub const DEFAULT_BUF_SIZE: usize = 16;

/// Configuration for an engine instance.
///
/// Injected at construction rather than read from globals, so several
/// engines can coexist in one OS process.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Buffer capacity used for port channels created by this engine.
    pub buf_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
        }
    }
}
