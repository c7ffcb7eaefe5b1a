//! Generated gRPC types for the keeper wire protocol.

#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/keeper.rs"));

/// `PollsResp.event_type`: nothing changed, frame is a heartbeat.
pub const DISCOVERY_EVENT_NONE: i32 = 0;
/// `PollsResp.event_type`: `services` carries upgraded service states.
pub const DISCOVERY_EVENT_UPDATE: i32 = 1;
