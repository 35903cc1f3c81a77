pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod lease;
pub mod proxy;
pub mod resource;
pub mod rotation;
pub mod services;
pub mod testing;

pub use error::RotationError;
pub use lease::{CredentialSource, Credentials, LeaseEvent, LeaseMode};
pub use proxy::LeaseAwareProxy;
pub use resource::{BuildError, ResourceBuilder, ResourceHandle};
pub use rotation::{Rotation, RotationPolicy, RotationReport};
