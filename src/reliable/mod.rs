//! Reliable, ordered delivery on top of an unreliable frame conduit: sequence numbering,
//!  acknowledgement tracking with adaptive retransmission timeouts, and the receive-side
//!  reorder buffer.

pub mod clock;
pub mod reorder;
pub mod retransmit_timer;
pub mod rtt;
pub mod tracker;
