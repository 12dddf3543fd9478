pub mod messaging;
pub mod runtime;
pub mod storage;

pub use messaging::*;
pub use runtime::*;
pub use storage::*;
