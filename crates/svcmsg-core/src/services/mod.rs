//! Reference services served by the daemon and used in tests.

pub mod echo;
pub mod queue;

pub use echo::{EchoService, EchoSession};
pub use queue::{QueueService, QueueSession};
