//! Standard component library
//!
//! Small ready-made processes for driving and terminating workflows.

mod sink;
mod source;

pub use sink::Sink;
pub use source::IpSource;
