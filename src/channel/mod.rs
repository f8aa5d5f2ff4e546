//! Channel lifecycle shared by the consumer and publisher variants (§3, §4.C, §4.D).

pub mod consumer;
pub mod publisher;

use std::fmt;

/// `init → opening → active → degraded → reopening → active | closed` (§4.C).
///
/// The consumer and publisher variants share this enum even though §4.C
/// describes it for the consumer specifically: the publisher's own
/// active/not-active distinction (§4.D) is the same shape, and giving both
/// variants one vocabulary keeps `Connection::healthy` uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, never opened.
    Init,
    /// A `create_channel`/subscribe attempt is in flight.
    Opening,
    /// Usable: consumer is receiving deliveries, publisher is publishing.
    Active,
    /// A transport error was observed; not yet attempting to reopen.
    Degraded,
    /// Actively retrying `open` on the parent connection's current handle.
    Reopening,
    /// Closed by `close()`; terminal, never reopens.
    Closed,
}

impl ChannelState {
    /// Whether the channel is usable for new work (publishes/deliveries).
    pub fn is_active(self) -> bool {
        matches!(self, ChannelState::Active)
    }

    /// Whether the channel still counts toward `Connection::healthy`, i.e.
    /// it hasn't been explicitly closed.
    pub fn is_healthy(self) -> bool {
        matches!(self, ChannelState::Active | ChannelState::Opening)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Init => "init",
            ChannelState::Opening => "opening",
            ChannelState::Active => "active",
            ChannelState::Degraded => "degraded",
            ChannelState::Reopening => "reopening",
            ChannelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identifies one of a connection's owned channels: the single publisher
/// channel, or a consumer channel keyed by the queue it's bound to (a
/// connection has at most one consumer channel per distinct queue name,
/// per §3 Invariants).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// The connection's single publisher channel.
    Publisher,
    /// A consumer channel, keyed by queue name.
    Consumer(String),
}
