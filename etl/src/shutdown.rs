//! Cooperative shutdown signaling for the pipeline.
//!
//! Abstracts tokio's watch channel into a pair of shutdown handle types. The
//! transmitter flips a flag; the pipeline observes it between tables and stops
//! before starting the next one, so the table in flight always reaches a terminal
//! state.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side of the shutdown channel.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a shutdown channel in the "keep running" state.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}
