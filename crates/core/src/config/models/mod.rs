pub mod common_topics;
pub mod observability;
pub mod queen_config;
pub mod resources_queue;

pub use common_topics::{CommonConfig, TopicsConfig};
pub use observability::ObservabilityConfig;
pub use queen_config::QueenConfig;
pub use resources_queue::{QueueConfig, ResourcesConfig};
