//! Engine, its options and the result envelope

pub mod engine;
pub mod options;
pub mod result;
