//! Call Engine Module - session lifecycle
//!
//! This module manages:
//! - Direct and group call sessions
//! - One peer link per remote participant
//! - Incoming invitations, screen share and recording flags

mod manager;

pub use manager::{CallSessionManager, CallState};
