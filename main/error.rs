//! Typed errors for the simulation core.
//!
//! Placement failures inside `deploy` are not errors: the scheduler reverts
//! any partial state and reports `false`, letting the cascade try the next
//! strategy. The variants here are the conditions that invalidate a run (or,
//! for [`SimError::MissingPairing`], mark a pairing as ineligible when a
//! caller chooses to surface it).

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// Missing or malformed configuration, unknown policy or generator name.
    Config(String),
    /// A job requests more processors than the cluster owns.
    ResourceExhausted {
        job: String,
        requested: u32,
        capacity: u32,
    },
    /// Nothing is executing, jobs are waiting, and no placement succeeds.
    Deadlock {
        job: String,
        requested: u32,
        idle: u32,
    },
    /// A co-scheduler was asked to pair jobs with an unknown heatmap entry.
    MissingPairing { job: String, co_job: String },
    /// A speedup update produced a non-positive or non-finite factor; the
    /// integrity of the trace is lost.
    NonconvergentSpeedup { job: String, speedup: f64 },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::Config(msg) => write!(f, "configuration error: {msg}"),
            SimError::ResourceExhausted {
                job,
                requested,
                capacity,
            } => write!(
                f,
                "job {job} requests {requested} processors but the cluster owns {capacity}"
            ),
            SimError::Deadlock {
                job,
                requested,
                idle,
            } => write!(
                f,
                "deadlock: job {job} waits for {requested} processors with {idle} idle and nothing executing"
            ),
            SimError::MissingPairing { job, co_job } => {
                write!(f, "no heatmap entry for pairing {job} with {co_job}")
            }
            SimError::NonconvergentSpeedup { job, speedup } => {
                write!(f, "job {job} reached a non-convergent speedup {speedup}")
            }
        }
    }
}

impl std::error::Error for SimError {}
