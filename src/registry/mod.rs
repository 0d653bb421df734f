mod registry;

pub use registry::LockRegistry;
pub use registry::RegistryError;
