//! Submit, track and execute batch jobs on a Fujitsu PJM cluster.
//!
//! The caller side ([`submission`], [`scheduler`]) prepares a working directory per job and
//! talks to the scheduler through its CLI. Inside the job, [`pipeline`] loads the persisted
//! context and drives the requested [`flow`] logic over a worker pool.

pub mod config;
pub mod flow;
pub mod job;
#[cfg(feature = "ledger")]
pub mod ledger;
pub mod pipeline;
pub mod scheduler;
pub mod submission;
