//! Boundary between the channel state machine and the outside world.
//!
//! The core never performs I/O or sleeps. It hands HTTP exchanges to a
//! [`Transport`], arms timers through a [`Scheduler`], and is fed the results
//! back as [`TransportEvent`]s and timer firings.

use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use url::Url;

/// Local handle for one HTTP exchange. Never reused within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

/// Progress of an exchange, reported by the transport in order:
/// one `Head`, any number of `Data`, then exactly one `Complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Head {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Data(Bytes),
    Complete(Completion),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The response body was fully received.
    Finished,
    /// Connection-level failure; no usable status.
    Failed(String),
    /// The transport's own deadline expired.
    TimedOut,
    /// The client has no network connectivity.
    Offline,
}

/// Performs HTTP exchanges on behalf of the channel.
///
/// Implementations must not call back into the channel synchronously; every
/// result is delivered later through `WebChannel::handle_transport_event`.
pub trait Transport: Send {
    fn send(&mut self, id: RequestId, request: HttpRequest);

    /// Abandons an exchange. No further events may be delivered for `id`.
    fn abort(&mut self, id: RequestId);

    /// Fire-and-forget request; no events are delivered for it.
    fn send_beacon(&mut self, url: Url);

    /// Probes general connectivity. The result, if any, is delivered through
    /// `WebChannel::handle_network_test_result`.
    fn test_network(&mut self, _url: Option<Url>) {}

    /// Whether `Data` events are emitted as bytes arrive. When false the request
    /// polls [`Transport::poll_data`] on a timer instead.
    fn notifies_incremental_data(&self) -> bool {
        true
    }

    /// Drains bytes received since the last call, for transports that do not
    /// notify incremental data.
    fn poll_data(&mut self, _id: RequestId) -> Option<Bytes> {
        None
    }
}

/// Every timer the channel can arm. Scheduling an armed key replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Watchdog(RequestId),
    Poll(RequestId),
    Throttle(RequestId),
    ForwardChannel,
    BackChannel,
    DeadBackChannel,
}

impl TimerKey {
    pub fn request(self) -> Option<RequestId> {
        match self {
            TimerKey::Watchdog(id) | TimerKey::Poll(id) | TimerKey::Throttle(id) => Some(id),
            _ => None,
        }
    }
}

/// Arms one-shot timers. A cancelled or replaced timer must never fire.
pub trait Scheduler: Send {
    fn schedule(&mut self, key: TimerKey, after: Duration);
    fn cancel(&mut self, key: TimerKey);
}

pub trait Clock: Send {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
