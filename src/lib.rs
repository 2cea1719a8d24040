pub mod comm;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod log;
pub mod orchestrator;
pub mod report;
pub mod results;
pub mod util;

pub use error::{Error, Result};
pub use events::{Event, EventBus, EventKind, Subscription};
pub use lifecycle::{TestLifecycleState, TestPhase};
pub use orchestrator::{RunId, TestOrchestrator};
pub use results::{MetricValue, ResultsRecord};
