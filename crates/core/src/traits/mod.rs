pub mod managers;
pub mod queue;

pub use managers::*;
pub use queue::*;
