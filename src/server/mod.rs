mod options;
mod server;
mod shutdown;
mod status_table;

pub use options::LockStatusServerOptions;
pub use server::LockStatusServer;
pub use shutdown::shutdown_signal;
pub use shutdown::LockStatusServerShutdownHandle;
pub use shutdown::LockStatusServerShutdownSignal;
