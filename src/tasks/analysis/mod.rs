mod maintenance;
mod worker;

pub(crate) use maintenance::release_expired_leases;
pub(crate) use worker::{lease_next_job, process_job, AnalysisServices};
