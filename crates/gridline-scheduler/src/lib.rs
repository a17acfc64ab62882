//! Matrix resolution, trigger dispatch and gating for Gridline.

pub mod bus;
pub mod dispatch;
pub mod exclusion;
pub mod gate;
pub mod matrix;
pub mod triggers;

pub use bus::InMemoryEventBus;
pub use dispatch::{Dispatcher, TriggerHandle};
pub use exclusion::ExclusionEngine;
pub use gate::GateAggregator;
pub use matrix::{MatrixPlan, MatrixResolver, ResolvedMatrix};
pub use triggers::{GitRef, TriggerEvent, TriggerMatcher};
