//! Process Supervisor errors: precondition violations and OS launch failures.
//! Failures while stopping or killing are logged by the supervisor, never returned.

#[derive(thiserror::Error, Debug)]
pub enum ProcError {
    #[error("Failed to start: process is currently running (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    #[error("Failed to stop: process isn't currently running")]
    NotRunning,

    #[error("Failed to start process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
