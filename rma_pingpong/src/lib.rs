//! Two-process one-sided PUT ping-pong over UCX.
//!
//! Peers bootstrap through MPI (worker addresses, remote keys, barriers) and
//! then exchange only one-sided writes: each side detects the other's write
//! by polling its own registered region for a sentinel byte pattern. Rank 0
//! reports half round-trip latency, message rate and bandwidth for a
//! geometric sweep of payload sizes.

pub mod bootstrap;
pub mod buffer;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod group;
pub mod loopback;
pub mod parquet_out;
pub mod registry;
pub mod report;
pub mod transport;
pub mod ucx;

pub use bootstrap::{Comm, comm_init};
pub use config::SweepConfig;
pub use engine::bench;
pub use error::{Error, Result};
