pub mod alternatives;
pub mod engine;
pub mod events;
pub mod ids;
pub mod models;
pub mod retry;
pub mod sweeper;

pub use alternatives::AlternativeFinder;
pub use engine::AllocationEngine;
pub use events::{Event, EventKind, EventSink, Severity, TracingEventSink};
pub use models::{
    AllocationError, AllocationMethod, AllocationRequest, AllocationResult, AlternativeSlot,
    AlternativesEnvelope, DepartmentInfo, DepartmentRequest, DoctorWorkload, PatientInfoInput,
    RecommendedAction, TargetedRequest, Token, TokenMetadata, TokenStatus,
};
pub use retry::RetryPolicy;
pub use sweeper::EngineBackgroundTasks;
