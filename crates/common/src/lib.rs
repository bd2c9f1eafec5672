// chatlog-common: shared types and utilities for the chatlog workspace

pub mod path;
pub mod protocol;
pub mod types;
