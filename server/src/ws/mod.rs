//! WebSocket transport: one actor per connection.
//!
//! The actor's writer half drains the connection's outbox; its reader half
//! decodes client envelopes and treats every inbound frame as activity.

pub mod actor;
pub mod handler;
pub mod protocol;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Evicted for falling behind on its send queue.
pub const CLOSE_SLOW_CONSUMER: u16 = 1008;
/// The core could not open the connection.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// No inbound frame within the idle timeout.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4000;
