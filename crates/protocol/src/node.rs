//! What every protocol node shares with its driver.

use std::sync::Arc;

use tracing::warn;

use sgc_crypto::{PkiDirectory, PublicParameter};
use sgc_types::{NodeId, Timestamp};

use crate::clock::{Clock, Timer};
use crate::config::SgcConfig;
use crate::error::ProtocolError;
use crate::message::Message;

/// Collaborators injected into every node.
#[derive(Clone)]
pub struct SgcContext {
    /// Output of the one-time setup.
    pub params: Arc<PublicParameter>,
    /// Public-key directory shared by all nodes.
    pub pki: Arc<dyn PkiDirectory>,
    pub clock: Arc<dyn Clock>,
    pub config: SgcConfig,
}

impl SgcContext {
    pub fn new(
        params: Arc<PublicParameter>,
        pki: Arc<dyn PkiDirectory>,
        clock: Arc<dyn Clock>,
        config: SgcConfig,
    ) -> Self {
        Self {
            params,
            pki,
            clock,
            config,
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Decode a frame, logging and discarding anything malformed.
    pub(crate) fn decode(&self, pid: NodeId, bytes: &[u8]) -> Option<Message> {
        match Message::decode(bytes, &self.params) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!(pid, error = %e, "Dropping malformed frame");
                None
            }
        }
    }
}

/// A protocol participant driven by an external scheduler.
///
/// Both calls return the frames to broadcast. `Err` is reserved for fatal
/// conditions; malformed or unexpected input yields an empty batch.
pub trait SgcNode {
    fn pid(&self) -> NodeId;

    fn handle_message(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError>;

    fn on_timer_tick(&mut self, timer: Timer) -> Result<Vec<Vec<u8>>, ProtocolError>;

    /// Timers the driver should keep armed for this node.
    fn timers(&self) -> &'static [Timer];
}

pub(crate) fn encode_all(msgs: Vec<Message>) -> Vec<Vec<u8>> {
    msgs.iter().map(Message::encode).collect()
}
