//! HTTP readiness probing

pub mod probe;
