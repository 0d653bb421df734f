mod gate;
mod handlers;

pub use gate::LockGate;
pub use gate::WaitOptions;
pub use handlers::GateHandlers;
pub use handlers::LockHandler;
