//! Sensor engine library
//!
//! Correlates events from an event bus against trigger dependency
//! expressions and enqueues a trigger job whenever an expression is
//! satisfied. The binary wires these pieces to the configured bus; the
//! library is exported for integration tests and embedding.

pub mod bus;
pub mod correlation;
pub mod error;
pub mod expr;
pub mod queue;
pub mod sensor;
pub mod store;

// Re-export commonly used types
pub use bus::{sensor_driver, SensorDriver, SubscribeRequest, TriggerConnection, TriggerHandler};
pub use correlation::{CorrelationConfig, Correlator, Disposition, Outcome};
pub use error::{BusError, BusResult};
pub use expr::{minify, BoolMinifier, DependencyExpression, ExpressionError};
pub use queue::{JobQueue, RedisJobQueue};
pub use sensor::{run_sensor, JobQueueHandler};
pub use store::{KeyValueStore, MemoryStore, StoreError};
