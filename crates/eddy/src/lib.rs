mod error;
mod performer;
mod poller;
mod reactor;
mod timer;

pub use eddy_timing as timing;
pub use error::{PerformError, ReactorError};
pub use performer::Performer;
pub use poller::{Backend, Condition};
pub use reactor::{Reactor, ReactorConfig, Stopper};
pub use timer::{MIN_INTERVAL, TimerHandle};
pub use tracing;
