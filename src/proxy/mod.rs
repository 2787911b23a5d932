//! Userspace data plane: accept redirected connections, find out where they
//! were headed, relay them there and watch the HTTP going by.

pub mod listener;
pub mod pipeline;
pub mod relay;
pub mod resolver;
pub mod tap;

pub use listener::ProxyListener;
pub use pipeline::{Pipeline, PipelineConfig, PipelineError, PipelineState};
#[cfg(target_os = "linux")]
pub use resolver::OriginalDstResolver;
pub use resolver::{DestinationResolver, RegistryResolver};
pub use tap::{Direction, LogSink, Observation, ObservationSink};
