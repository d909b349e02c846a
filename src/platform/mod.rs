//! Runtime glue shared by the engine's background tasks.

pub mod runtime;
