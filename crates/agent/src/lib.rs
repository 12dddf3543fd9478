pub mod announcer;
pub mod dispatcher;
pub mod group;
pub mod pipeline;
pub mod service;
pub mod stdio;
pub mod worker;

pub use announcer::{client_info, ConnectionInfoAnnouncer};
pub use dispatcher::Dispatcher;
pub use group::{detached_token, TaskGroup};
pub use pipeline::{Connector, Endpoints, Inbound, Outbound};
pub use service::AgentService;
pub use worker::{Worker, WorkerContext, WorkerEvent};
