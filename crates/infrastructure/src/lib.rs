pub mod event_bus;
pub mod in_memory_queue;
pub mod memory_store;

pub use event_bus::LocalEventBus;
pub use in_memory_queue::{InMemoryQueueClient, InMemoryQueueConfig};
pub use memory_store::{
    InMemoryArtifactManager, InMemoryErrorCodeRepository, InMemoryJobManager, InMemoryUserManager,
};
