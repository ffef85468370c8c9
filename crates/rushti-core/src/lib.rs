pub mod connection;
pub mod error;
pub mod ids;
pub mod signature;
pub mod task;

pub use connection::{decode_password_at_rest, ConnectionDescriptor};
pub use error::{LoadError, PersistenceError, ResumeError, RuntimeError, RushtiError};
pub use ids::{InstanceKey, RunId, Signature, TaskId};
pub use signature::compute_signature;
pub use task::{
    SchedulingAlgorithm, Statement, Task, Wait, Workflow, WorkflowMetadata, WorkflowMode,
    WorkflowSettings,
};
