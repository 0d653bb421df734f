mod usage_counter;

pub use usage_counter::CounterCreationError;
pub use usage_counter::UsageCounter;
