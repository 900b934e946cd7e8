//! Supervised execution of external programs.

mod runner;

pub use runner::{ProcessError, ProcessOutput, ProcessRunner, ProcessSpec};
