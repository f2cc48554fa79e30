pub mod error;
pub mod types;
pub mod value;

pub use error::{AppError, ContainerError, Outcome, Result};
pub use types::{EntityKey, InstanceId, InvocationId, StateMap};
pub use value::Value;
