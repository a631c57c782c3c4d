//! Job events and the publish/subscribe mechanics that carry them.

pub mod bus;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::{Event, JobEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
