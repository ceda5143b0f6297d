//! Types shared between the vmpod host runtime and its callers.

pub mod errors;
pub mod transport;

pub use errors::{VmpodError, VmpodResult};
pub use transport::Transport;
