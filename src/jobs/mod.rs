//! Background work: resumable bulk jobs, the scheduler dispatcher, the
//! daily maintenance ticker and the administrative reset.

pub mod dispatcher;
pub mod maintenance;
pub mod reset;
pub mod runner;
pub mod sweep;
#[cfg(test)]
pub(crate) mod test_support;
pub mod token;

pub use dispatcher::{JobDispatcher, spawn_dispatcher};
pub use maintenance::{
    MaintenanceTicker, TickReport, spawn_lock_reaper, spawn_maintenance_ticker,
};
pub use reset::{AdminReset, RESET_CONFIRMATION, ResetLogEntry, ResetReport};
pub use runner::{BatchReport, BatchRunner, ItemFailure, RUN_BULK_HOOK, RunOutcome};
pub use sweep::SweepReport;
pub use token::{BulkJobToken, JobKind, TokenLookup};
