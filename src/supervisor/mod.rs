pub mod error;
pub mod process;
pub mod state_machine;

pub use error::ProcError;
pub use process::{ChildProcess, ProcessSpec, ServerProcess, STOP_COMMAND};
pub use state_machine::{ServerStatus, StateMachine};
