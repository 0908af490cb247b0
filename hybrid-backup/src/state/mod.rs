//! State snapshots and pre/post validation.

pub mod snapshot;
pub mod validator;

pub use snapshot::{default_report_path, latest_report, Report, StateSnapshot};
pub use validator::{compare, ServiceHealth, Status, ValidationReport};
