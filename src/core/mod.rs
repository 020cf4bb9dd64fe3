//! 核心层：错误类型、交互协议、节拍器、关闭处理与实验编排

pub mod error;
pub mod orchestrator;
pub mod pacemaker;
pub mod protocol;
pub mod shutdown;

pub use error::{BenchError, MailboxError};
pub use orchestrator::{run_bench, BenchReport, Launch, Orchestrator, RunOutcome};
pub use pacemaker::Pacemaker;
pub use protocol::{ActionMessage, ControlSignal, StepMessage};
pub use shutdown::{ShutdownManager, ShutdownReason, StepOutcome, TeardownCoordinator, TeardownReport};
