//! Lambda builder
//!
//! Turns "build start" events into container images: downloads a tenant's
//! parser source, wraps it in a Lambda handler, builds and pushes an image
//! with an isolated rootless job, archives the packaged source and announces
//! the outcome.

pub mod api;
pub mod config;
pub mod db;
pub mod deadline;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod storage;

#[cfg(test)]
mod testing;
