//! Process-level concerns: signal-driven cancellation and the operation lock.

pub mod lock;
pub mod shutdown;

pub use lock::OperationLock;
pub use shutdown::ShutdownCoordinator;
