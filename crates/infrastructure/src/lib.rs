pub mod bus_factory;
pub mod filesystem;
pub mod in_memory_bus;
pub mod observability;
pub mod redis_bus;
pub mod shell_runtime;

pub use bus_factory::{BusFactory, BusHandles};
pub use filesystem::{FileSystemRegistry, LocalFileSystem, ObjectStoreFileSystem};
pub use in_memory_bus::{InMemoryBus, InMemoryBusConfig};
pub use observability::{init_logging, init_test_logging};
pub use redis_bus::{RedisBus, RedisBusConfig};
pub use shell_runtime::ShellRuntime;
