//! SGC group membership and session key protocol.
//!
//! # Roles
//!
//! - **Coordinator**: broadcasts a Heartbeat with the current key verifier
//!   and every live group, hands out one slot at a time, verifies joins and
//!   returns decryption shares, and chooses which member distributes the
//!   next session key.
//! - **Member**: acknowledges Heartbeats, joins the slot it is assigned,
//!   applies other members' joins to its own key pair, and encrypts or
//!   decrypts session keys.
//!
//! # Driving a node
//!
//! Nodes own no threads and read no wall clock. A driver hands each node
//! incoming frames through [`SgcNode::handle_message`] and fires the timers
//! listed by [`SgcNode::timers`] through [`SgcNode::on_timer_tick`]; both
//! return the frames to broadcast.
//!
//! # Session keys
//!
//! A session key is adopted only when both its verifier (from a Heartbeat or
//! KeyUpdateAck) and the key bytes (decrypted, or generated locally) are
//! known, in either order. See [`SessionKeyBook`].

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod group;
pub mod liveness;
pub mod member;
pub mod message;
pub mod node;
pub mod session;

pub use clock::{Clock, ManualClock, Timer};
pub use config::SgcConfig;
pub use coordinator::{Coordinator, CoordinatorState};
pub use error::{CodecError, ProtocolError};
pub use group::{GroupSessionInfo, ManagedGroup};
pub use liveness::{LivenessIndex, MemberRecord};
pub use member::Member;
pub use message::{
    Heartbeat, HeartbeatAck, Join, JoinAck, KeyDistribution, KeyEncapNotify, KeyUpdateAck,
    Message, MsgType, NotifyPosition,
};
pub use node::{SgcContext, SgcNode};
pub use session::SessionKeyBook;
