//! CLI command implementations.

pub mod batch;
pub mod experiment;
pub mod harness;
pub mod replay;
pub mod run;
pub mod sweep;
