//! 执行层：引擎主循环、条目恢复状态机、节流退避与执行总结

pub mod engine;
pub mod pacing;
pub mod recovery;
pub mod summary;

pub use engine::{Capabilities, ExecutionEngine};
pub use pacing::{Backoff, CallPacer};
pub use recovery::{ItemOutcome, RecoveryMachine, RecoverySettings};
pub use summary::{success_rate, ItemReport, Summary, Tone};
