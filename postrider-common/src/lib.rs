pub mod backpressure;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod status;
pub mod xtext;

pub use tracing;

/// Control signal broadcast to listeners, sessions, and samplers.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
    Finalised,
}
