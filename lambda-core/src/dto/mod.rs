//! DTOs for communication with the outside world
//!
//! - `event`: inbound build-start events from deployment automation
//! - `status`: outbound status events for the deployment controller
//! - `build`: API views of recorded builds and event receipts

pub mod build;
pub mod event;
pub mod status;
