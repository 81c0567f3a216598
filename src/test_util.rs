use std::sync::Mutex;
use std::time::{Duration, Instant};
use bytes::Bytes;
use crate::message_dispatcher::ProtocolHandler;
use crate::reliable::clock::Clock;
use crate::util::lock;

/// A clock that only moves when told to
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *lock(&self.now) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// records every dispatched message in order
#[derive(Default)]
pub struct CollectingHandler {
    received: Mutex<Vec<(u16, Bytes)>>,
}

impl CollectingHandler {
    pub fn received(&self) -> Vec<(u16, Bytes)> {
        lock(&self.received).clone()
    }
}

impl ProtocolHandler for CollectingHandler {
    fn on_message(&self, protocol_id: u16, payload: Bytes) {
        lock(&self.received).push((protocol_id, payload));
    }
}
