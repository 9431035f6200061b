//! # Shared infrastructure for the Confero media engine
//!
//! `infra-common` holds the pieces every other crate leans on but none owns:
//! lock-free queues for handing media between capture/encode/network threads,
//! a monotonic clock abstraction so time-driven components stay testable,
//! the `MetricsSink` trait consumed by the engine, and `tracing` setup.

pub mod clock;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod ring;

pub use clock::{Clock, MonotonicClock};
pub use logging::{setup_logging, LoggingConfig};
pub use metrics::{Labels, MetricsSink, NoopMetrics};
pub use queue::{MpscQueue, SpscQueue};
pub use ring::AudioRingBuffer;
