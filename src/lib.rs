pub mod cli;
pub mod constants;
pub mod errors;
pub mod transport;

pub mod managers {
    pub mod exec;
    pub mod hosts;
    pub mod stream;
}

pub mod services {
    pub mod host_registry;
    pub mod logger;
    pub mod status_cache;
}

pub mod utils {
    pub mod fs_atomic;
    pub mod paths;
    pub mod redact;
}

pub use errors::{ErrorKind, HostError};
pub use managers::exec::{ExecOptions, ExecOutput, ExecutionType};
pub use managers::hosts::connection::Connection;
pub use managers::hosts::probe::StatusResult;
pub use managers::hosts::{ConnectOptions, HostManager, HostStatus, PoolStats};
pub use managers::stream::{StreamEvent, StreamOptions, StreamSession, StreamStats};
pub use services::host_registry::{HostConfig, HostRegistry};
pub use services::logger::Logger;
pub use services::status_cache::{StatusCache, StatusEntry};
