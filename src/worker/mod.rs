//! # Worker
//!
//! Runs next to the user's command on the execution host. The wrapper is the
//! only writer of RUNNING and of the command's own outcome; everything else it
//! learns from the store (a KILL_SELF request shows up as a rejected heartbeat).

pub mod wrapper;

pub use wrapper::{WorkerOutcome, WorkerWrapper};
