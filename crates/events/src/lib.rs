//! `offload-events`: lifecycle events and the pub/sub bus that carries them.

pub mod bus;
pub mod in_memory_bus;
pub mod lifecycle;

pub use bus::{EventBus, RecvTimeoutError, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use lifecycle::{LifecycleEvent, LifecycleEventKind};
