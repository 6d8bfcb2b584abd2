//! Stream combinators and rate control for bus event streams.

mod throttle;
mod update_rate;

pub use throttle::{Throttle, ThrottleExt};
pub use update_rate::UpdateRate;
