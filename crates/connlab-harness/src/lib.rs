pub mod admission;
pub mod config;
pub mod connection;
mod exchange;
pub mod instrumentation;
mod ledger;
pub mod rendezvous;
pub mod scenarios;
pub mod scheduler;
pub mod server;

pub use admission::{AdmissionController, AdmissionSnapshot, DEFAULT_GROUP};
pub use config::HarnessConfig;
pub use instrumentation::{HookReply, IoEvent, ReadEvent, WriteEvent};
pub use rendezvous::{RendezvousControl, RendezvousTask, TaskState};
pub use scheduler::{
    Harness, Operation, OperationKind, OperationOptions, OperationReadHandler, OperationReport,
    OperationState, OperationWriteHandler, RequestHandle,
};
