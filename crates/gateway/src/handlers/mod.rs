//! API handlers module

pub mod generation;
pub mod health;
pub mod jobs;
