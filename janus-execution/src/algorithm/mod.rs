//! Built-in execution algorithms.

pub mod best_limit;
pub mod stop;
pub mod twap;

pub use best_limit::BestLimit;
pub use stop::StopTrigger;
pub use twap::Twap;
