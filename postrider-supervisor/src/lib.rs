pub mod error;
pub mod exit;
pub mod sampler;
pub mod slot;
pub mod supervisor;

pub use error::SupervisorError;
pub use exit::ExitStatus;
pub use sampler::{QueueSampler, SamplerConfig};
pub use slot::WorkerSlot;
pub use supervisor::{Supervisor, SupervisorConfig, drop_privileges};
