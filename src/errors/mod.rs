mod host_error;

pub use host_error::{ErrorKind, HostError};
