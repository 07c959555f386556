pub mod config;
pub mod reconcile;
pub mod request;
pub mod types;

pub use config::{CiCredentials, Config};
pub use reconcile::reconcile;
pub use request::{BuildRequest, ValidationError};
pub use types::*;
