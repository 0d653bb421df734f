//! Deciding whether a lock key is idle from the statuses its instances published.
mod evaluator;
mod status;

pub use evaluator::are_all_idle;
pub use evaluator::drive_gate;
pub use evaluator::expiry_timer;
pub use evaluator::ConsensusVerdict;
pub use status::split_lock_data;
pub use status::validate_lock_data;
pub use status::InstancePeerStatus;
pub use status::LOCK_DATA_SEPARATOR;
