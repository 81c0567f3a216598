use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::bail;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

/// Reserved for acknowledgement frames, which are handled by the transport itself
pub const ACK_PROTOCOL_ID: u16 = 0xFFFF;

/// Application code receiving the payloads of one protocol id.
///
/// This is called synchronously from the receive path of a connection, holding up the processing
///  of subsequent frames. Non-trivial work should be offloaded.
#[cfg_attr(test, automock)]
pub trait ProtocolHandler: Send + Sync + 'static {
    fn on_message(&self, protocol_id: u16, payload: Bytes);
}

#[derive(Default)]
pub struct ProtocolRegistryBuilder {
    handlers: FxHashMap<u16, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistryBuilder {
    pub fn new() -> ProtocolRegistryBuilder {
        Default::default()
    }

    pub fn register(mut self, protocol_id: u16, handler: Arc<dyn ProtocolHandler>) -> anyhow::Result<ProtocolRegistryBuilder> {
        if protocol_id == ACK_PROTOCOL_ID {
            bail!("protocol id {:#06x} is reserved for acknowledgements", protocol_id);
        }

        match self.handlers.entry(protocol_id) {
            Entry::Occupied(_) => bail!("registering a second handler for protocol id {}", protocol_id),
            Entry::Vacant(e) => {
                e.insert(handler);
            }
        }
        Ok(self)
    }

    pub fn build(self) -> ProtocolRegistry {
        ProtocolRegistry {
            handlers: self.handlers,
        }
    }
}

/// The mapping from protocol ids to handlers. It is built once at startup and immutable after
///  that, so it can be shared between connections.
pub struct ProtocolRegistry {
    handlers: FxHashMap<u16, Arc<dyn ProtocolHandler>>,
}

impl Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut ids = self.handlers.keys().collect::<Vec<_>>();
        ids.sort();
        write!(f, "ProtocolRegistry{{ids:{:?}}}", ids)
    }
}

impl ProtocolRegistry {
    pub fn is_registered(&self, protocol_id: u16) -> bool {
        self.handlers.contains_key(&protocol_id)
    }

    /// Frames for an unknown protocol id are dropped: their framing is intact, so there is no
    ///  reason to close the connection.
    pub fn dispatch(&self, protocol_id: u16, payload: Bytes) {
        match self.handlers.get(&protocol_id) {
            Some(handler) => {
                trace!("dispatching {} bytes to protocol {}", payload.len(), protocol_id);
                handler.on_message(protocol_id, payload);
            }
            None => {
                warn!("received message for unregistered protocol id {} - dropping", protocol_id);
            }
        }
    }
}
