//! Adapters for secrets held in the cluster and in the external vault

mod secrets;
mod vault;

pub use secrets::*;
pub use vault::*;
