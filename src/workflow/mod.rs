pub mod flow;
pub mod observer;
pub mod types;

#[cfg(test)]
pub(crate) mod fakes;

pub use flow::{run_implementation, FlowSettings, ImplementationFlow};
pub use observer::{JsonlObserver, NullObserver, StageEvent, StageObserver, TracingObserver};
pub use types::{
    CommitRecord, Stage, StageOutcome, StageResult, WorkflowError, WorkflowRequest,
    WorkflowResult, WorkflowStatus,
};
