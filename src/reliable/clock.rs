use std::time::Instant;
#[cfg(test)] use mockall::automock;

/// Source of the current time for timeout and RTT bookkeeping. Tests plug in a manually advanced
///  clock to make retransmission deterministic.
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
