pub mod backend;
pub mod error;
pub mod state;

pub use backend::{Backend, BackendDescriptor, BackendKind, RestartPolicy};
pub use error::{DomainError, Result};
pub use state::BackendState;
