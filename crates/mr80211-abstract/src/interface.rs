use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::frame::MacFrame;

/// The timers a MAC instance schedules through its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimerKind {
    Backoff,
    Defer,
    /// Response timeout for the frame currently on the air.
    Send,
    /// End of the frame currently being received.
    Recv,
    Nav,
    /// End of our own transmission.
    Interface,
}

impl TimerKind {
    pub const ALL: [TimerKind; 6] = [
        TimerKind::Backoff,
        TimerKind::Defer,
        TimerKind::Send,
        TimerKind::Recv,
        TimerKind::Nav,
        TimerKind::Interface,
    ];
}

/// Why a MAC gave up on a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxFailReason {
    /// No CTS after `short_retry_limit` RTS attempts.
    Rts,
    /// No ACK after the short or long retry limit.
    Ack,
}

/// Services the simulator provides to a MAC during a callback.
///
/// Every action is applied after the callback returns, in the order
/// it was requested.
pub trait MacContext {
    /// Current virtual time in seconds.
    fn now(&self) -> f64;

    /// Schedule `timer` to expire `delay` seconds from now. Any previous
    /// schedule of the same timer must have been cancelled first.
    fn start_timer(&mut self, timer: TimerKind, delay: f64);

    /// Invalidate the pending expiry of `timer`.
    fn cancel_timer(&mut self, timer: TimerKind);

    /// Put a frame on the air. `frame.txtime` must be set.
    fn transmit(&mut self, frame: MacFrame);

    /// Hand a received data frame (MAC header stripped) to the upper layer.
    fn deliver_up(&mut self, frame: MacFrame);

    /// Queue a frame for transmission again from this station (AP relay).
    fn forward(&mut self, frame: MacFrame);

    /// Report that a data frame was abandoned after exhausting its retries.
    fn tx_failed(&mut self, frame: MacFrame, reason: TxFailReason);

    /// The MAC has finished with the last packet handed down and can accept another.
    fn upper_ready(&mut self);

    /// Simulation-wide random source.
    fn rng(&mut self) -> &mut dyn RngCore;
}
