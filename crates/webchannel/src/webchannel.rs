use serde_json::Value;
use tracing::trace;

use crate::base::{ChannelState, WebChannelBase};
use crate::codec::WireV8;
use crate::config::ChannelConfig;
use crate::connection_state::ConnectionState;
use crate::context::ChannelContext;
use crate::error::WebChannelResult;
use crate::handler::{Handler, MapContext};
use crate::stats::StatsSink;
use crate::transport::{RequestId, Scheduler, SystemClock, TimerKey, Transport, TransportEvent};

/// Where and how to connect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    pub test_path: String,
    pub channel_path: String,
    pub extra_params: Vec<(String, String)>,
    /// Session id and last array id of a previous session to resume from.
    pub old_session: Option<(String, i64)>,
}

impl ConnectOptions {
    pub fn new(test_path: impl Into<String>, channel_path: impl Into<String>) -> Self {
        Self {
            test_path: test_path.into(),
            channel_path: channel_path.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    pub fn resume(mut self, session_id: impl Into<String>, last_array_id: i64) -> Self {
        self.old_session = Some((session_id.into(), last_array_id));
        self
    }
}

/// One channel: its collaborators plus the session state machine.
///
/// Purely reactive. The embedder (or [`crate::runtime`]) feeds transport
/// events, timer firings and network probe results back in; every call runs
/// to completion without blocking.
pub struct WebChannel {
    cx: ChannelContext,
    base: WebChannelBase,
}

impl WebChannel {
    pub fn new(cx: ChannelContext) -> Self {
        let base = WebChannelBase::new(&cx.config);
        Self { cx, base }
    }

    /// Builds a channel on the system clock and the v8 wire codec.
    pub fn with_defaults(
        config: ChannelConfig,
        transport: Box<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        stats: Box<dyn StatsSink>,
        handler: Box<dyn Handler>,
    ) -> Self {
        Self::new(ChannelContext::new(
            config,
            transport,
            scheduler,
            Box::new(SystemClock),
            stats,
            handler,
            Box::new(WireV8),
        ))
    }

    /// Reuses negotiation results from an earlier channel to the same server.
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.cx.connection_state = state;
    }

    pub fn connect(&mut self, options: ConnectOptions) -> WebChannelResult<()> {
        self.base.connect(
            &mut self.cx,
            &options.test_path,
            &options.channel_path,
            options.extra_params,
            options.old_session,
        )
    }

    pub fn send_map(&mut self, payload: Value, context: Option<MapContext>) -> WebChannelResult<()> {
        self.base.send_map(&mut self.cx, payload, context)
    }

    pub fn disconnect(&mut self) {
        self.base.disconnect(&mut self.cx);
    }

    pub fn handle_transport_event(&mut self, id: RequestId, event: TransportEvent) {
        trace!(target = "webchannel", id = %id, event = ?event, "transport event");
        self.base.handle_transport_event(&mut self.cx, id, event);
    }

    pub fn handle_timer(&mut self, key: TimerKey) {
        trace!(target = "webchannel", key = ?key, "timer fired");
        self.base.handle_timer(&mut self.cx, key);
    }

    pub fn handle_network_test_result(&mut self, up: bool) {
        self.base.handle_network_test_result(&mut self.cx, up);
    }

    pub fn handle_browser_offline(&mut self) {
        self.base.on_browser_offline(&mut self.cx);
    }

    pub fn state(&self) -> ChannelState {
        self.base.state()
    }

    pub fn is_closed(&self) -> bool {
        self.base.state() == ChannelState::Closed
    }

    pub fn session_id(&self) -> &str {
        self.base.session_id()
    }

    pub fn is_buffered(&self) -> bool {
        self.base.is_buffered()
    }

    pub fn last_array_id(&self) -> i64 {
        self.base.last_array_id()
    }

    pub fn last_status_code(&self) -> Option<u16> {
        self.base.last_status_code()
    }

    pub fn host_prefix(&self) -> Option<&str> {
        self.base.host_prefix()
    }

    pub fn channel_version(&self) -> u32 {
        self.base.channel_version()
    }

    pub fn server_version(&self) -> Option<i64> {
        self.base.server_version()
    }

    pub fn http_session_id(&self) -> Option<&str> {
        self.cx.http_session_id.as_deref()
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.cx.connection_state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.cx.config
    }

    pub fn outgoing_map_count(&self) -> usize {
        self.base.outgoing_map_count()
    }

    pub fn pending_map_count(&self) -> usize {
        self.base.pending_map_count()
    }

    /// True while any forward request is in flight or maps wait to be sent.
    pub fn has_outstanding_requests(&self) -> bool {
        self.base.forward_channel_pool().has_pending_request() || self.base.outgoing_map_count() > 0
    }

    pub fn base(&self) -> &WebChannelBase {
        &self.base
    }
}
