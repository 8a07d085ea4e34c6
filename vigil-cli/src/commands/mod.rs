//! CLI command implementations.

pub mod leave;
pub mod remote;
pub mod remove;
pub mod serve;
pub mod status;
pub mod version;
