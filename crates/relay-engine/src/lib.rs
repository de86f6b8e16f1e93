pub mod batch;
pub mod chain;
pub mod flow;
pub mod retry;
pub mod stage;
pub mod stream;

pub use batch::Batch;
pub use chain::Chain;
pub use flow::{Flow, FlowHandlers, NestedFlow};
pub use retry::RetryPolicy;
pub use stage::{FlowStage, RequestStage, Stage, StageExt};
pub use stream::{StreamMode, StreamPolicy, TextEncoding};
