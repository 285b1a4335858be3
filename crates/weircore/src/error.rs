use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeirError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),

    #[error("Packet error: {0}")]
    Ip(#[from] IpError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Both parameter ports already have a channel, so can't choose which to share")]
    AmbiguousParamConnect,

    #[error("Unknown input port: {0}")]
    UnknownInPort(String),

    #[error("Unknown output port: {0}")]
    UnknownOutPort(String),

    #[error("Unknown parameter port: {0}")]
    UnknownParamPort(String),

    #[error("Channel disconnected: {0}")]
    Disconnected(String),
}

#[derive(Error, Debug)]
pub enum IpError {
    #[error("Could not {action} '{path}': {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse audit file '{path}': {source}")]
    AuditJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Could not find parameter '{name}' in packet with path '{path}'")]
    MissingParam { name: String, path: String },

    #[error("Could not find key '{name}' in packet with path '{path}'")]
    MissingKey { name: String, path: String },

    #[error("Can not add value '{new}' to key '{key}' holding different value '{existing}'")]
    KeyConflict {
        key: String,
        new: String,
        existing: String,
    },

    #[error("Shell command failed: '{command}': {detail}")]
    Shell { command: String, detail: String },
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Missing binding for placeholder '{placeholder}' in command '{command}'")]
    MissingBinding {
        placeholder: String,
        command: String,
    },

    #[error("Empty substitution for placeholder '{placeholder}' in command '{command}'")]
    EmptySubstitution {
        placeholder: String,
        command: String,
    },

    #[error("Missing input path on port '{port}'")]
    MissingInputPath { port: String },

    #[error("Could not spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed with {status}: '{command}': {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Process '{0}' is not fully connected")]
    Unconnected(String),

    #[error("Workflow has no sink process")]
    NoSink,

    #[error("Process task failed to join: {0}")]
    Join(String),
}
