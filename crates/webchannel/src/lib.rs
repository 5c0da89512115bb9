//! webchannel: an ordered, reliable, bidirectional message channel over plain HTTP.
//!
//! Traffic is split into a forward channel (client to server, one POST per batch of
//! queued maps) and a back channel (server to client, a long-lived hanging GET the
//! server writes chunk-framed arrays into). Before a session opens, a two-stage test
//! channel performs the handshake and detects buffering proxies that would hold a
//! streamed response back until it completes.
//!
//! Layers:
//! - [`codec`]: wire encoding of outgoing maps and decoding of response arrays
//! - [`request`]: a single HTTP exchange with watchdog and chunk decoding
//! - [`pool`]: the forward-channel request pool
//! - [`test_channel`]: handshake and buffering-proxy probe
//! - [`base`]: the session state machine, queues and retry policy
//! - [`webchannel`]: the facade that owns everything and routes events
//! - [`runtime`]: a tokio actor that drives a [`WebChannel`] over reqwest
//!
//! The core is sans-I/O: it issues commands through the [`Transport`] and
//! [`Scheduler`] traits and is fed back through
//! [`WebChannel::handle_transport_event`] and [`WebChannel::handle_timer`].

pub mod base;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection_state;
pub mod context;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod request;
pub mod runtime;
pub mod stats;
pub mod test_channel;
pub mod transport;
mod uri;
pub mod webchannel;

#[cfg(test)]
pub(crate) mod testing;

pub use base::{ChannelState, WebChannelBase};
pub use codec::{WireCodec, WireV8, LATEST_CHANNEL_VERSION};
pub use config::ChannelConfig;
pub use connection_state::ConnectionState;
pub use error::{ChannelError, CodecError, RequestError, WebChannelError, WebChannelResult};
pub use handler::{Handler, HandlerError, MapContext, QueuedMap};
pub use metrics::PrometheusStats;
pub use stats::{NoopStats, ServerReachability, Stat, StatsSink};
pub use transport::{
    Clock, Completion, HttpRequest, Method, RequestId, Scheduler, SystemClock, TimerKey,
    Transport, TransportEvent,
};
pub use webchannel::{ConnectOptions, WebChannel};
