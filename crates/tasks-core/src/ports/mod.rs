//! Ports - 抽象化レイヤー
//!
//! engine が外部に依存する部分（storage, 時計, ID 採番, メトリクス）を
//! trait として切り出します。

pub mod clock;
pub mod id_generator;
pub mod metrics;
pub mod storage;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::metrics::{InMemoryMetrics, MetricsRegistry, NoopMetrics, Tags};
pub use self::storage::Storage;
