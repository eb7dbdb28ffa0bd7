pub mod batch_orchestrator;
pub mod progress;

pub use batch_orchestrator::{BatchOrchestrator, BatchRequest, BatchTicket};
pub use progress::{ProgressRegistry, ProgressStatus};
