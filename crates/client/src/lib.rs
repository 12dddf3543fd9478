pub mod fold;
pub mod operator;
pub mod tracker;

pub use fold::{order_messages, DiscoverFold, JobFold};
pub use operator::{Operator, StdoutChunk};
pub use tracker::{JobTracker, DEFAULT_FETCH_BATCH_SIZE};
