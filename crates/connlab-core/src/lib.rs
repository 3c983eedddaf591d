pub mod auth;
pub mod error;
pub mod flags;
pub mod handler;
pub mod http;
pub mod invariants;
pub mod net;
pub mod test_support;

pub use error::{ErrorKind, HarnessError, TransportPhase};
pub use flags::{OperationFlags, RequestFlags};
