//! Lambda Core
//!
//! Core types shared by the lambda builder service.
//!
//! This crate contains:
//! - Domain types: build requests, build jobs and their lifecycle, artifacts
//! - DTOs: inbound build events, outbound status events and API views

pub mod domain;
pub mod dto;
