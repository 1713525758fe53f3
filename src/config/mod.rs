//! Configuration: JSON schema plus a lock-free cached store

mod schema;
mod store;

pub use schema::*;
pub use store::{ConfigChange, ConfigStore};
