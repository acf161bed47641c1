mod registry;
mod types;

pub use registry::HandleRegistry;
pub use types::{HandleId, RegistrationId, RegistryError};
