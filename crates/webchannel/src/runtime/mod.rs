//! Tokio driver for a [`WebChannel`].
//!
//! One actor task owns the channel. Commands from [`WebChannelHandle`],
//! transport events from [`ReqwestTransport`] tasks and timer firings from
//! [`TokioScheduler`] sleeps are serialized through its queues, so the
//! channel is only ever touched from that task.

mod http;
mod timer;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::base::ChannelState;
use crate::codec::WireV8;
use crate::config::ChannelConfig;
use crate::connection_state::ConnectionState;
use crate::context::ChannelContext;
use crate::error::{ChannelError, WebChannelError, WebChannelResult};
use crate::handler::{Handler, HandlerError, MapContext, QueuedMap};
use crate::stats::StatsSink;
use crate::transport::{RequestId, SystemClock, TimerKey, TransportEvent};
use crate::webchannel::{ConnectOptions, WebChannel};

pub use http::ReqwestTransport;
pub use timer::TokioScheduler;

use timer::TimerTable;

/// Internal inputs produced by the transport and scheduler.
#[derive(Debug)]
pub(crate) enum DriverInput {
    Transport { id: RequestId, event: TransportEvent },
    Timer { key: TimerKey, generation: u64 },
    NetworkTest { up: bool },
}

enum Command {
    Connect(ConnectOptions, oneshot::Sender<WebChannelResult<()>>),
    SendMap(Value, Option<MapContext>, oneshot::Sender<WebChannelResult<()>>),
    Disconnect(oneshot::Sender<()>),
    BrowserOffline,
    Snapshot(oneshot::Sender<ChannelSnapshot>),
}

/// Point-in-time view of a driven channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub session_id: String,
    pub buffered: bool,
    pub last_array_id: i64,
    pub host_prefix: Option<String>,
    pub channel_version: u32,
    pub outgoing_maps: usize,
    pub pending_maps: usize,
    /// Negotiation results; pass to the next [`spawn`] to skip the
    /// connection test on reconnect.
    pub connection_state: ConnectionState,
}

impl ChannelSnapshot {
    fn of(channel: &WebChannel) -> Self {
        Self {
            state: channel.state(),
            session_id: channel.session_id().to_string(),
            buffered: channel.is_buffered(),
            last_array_id: channel.last_array_id(),
            host_prefix: channel.host_prefix().map(str::to_string),
            channel_version: channel.channel_version(),
            outgoing_maps: channel.outgoing_map_count(),
            pending_maps: channel.pending_map_count(),
            connection_state: channel.connection_state().clone(),
        }
    }
}

/// Cloneable async front end of a driven channel. Dropping every handle
/// disconnects the channel and stops the actor.
#[derive(Clone)]
pub struct WebChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl WebChannelHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> WebChannelResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| WebChannelError::Driver)?;
        rx.await.map_err(|_| WebChannelError::Driver)
    }

    pub async fn connect(&self, options: ConnectOptions) -> WebChannelResult<()> {
        self.request(|tx| Command::Connect(options, tx)).await?
    }

    pub async fn send_map(&self, payload: Value) -> WebChannelResult<()> {
        self.request(|tx| Command::SendMap(payload, None, tx)).await?
    }

    pub async fn send_map_with_context(&self, payload: Value, context: MapContext) -> WebChannelResult<()> {
        self.request(|tx| Command::SendMap(payload, Some(context), tx))
            .await?
    }

    pub async fn disconnect(&self) -> WebChannelResult<()> {
        self.request(Command::Disconnect).await
    }

    pub async fn snapshot(&self) -> WebChannelResult<ChannelSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Reports that the client lost connectivity.
    pub fn browser_offline(&self) -> WebChannelResult<()> {
        self.commands
            .send(Command::BrowserOffline)
            .map_err(|_| WebChannelError::Driver)
    }
}

/// Handler callbacks surfaced as a stream.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened,
    Array(Value),
    Delivered(Vec<QueuedMap>),
    Error(ChannelError),
    Closed {
        pending: Vec<QueuedMap>,
        undelivered: Vec<QueuedMap>,
    },
}

/// [`Handler`] that forwards every callback as a [`ChannelEvent`].
pub struct ForwardingHandler {
    events: mpsc::UnboundedSender<ChannelEvent>,
    additional_params: Vec<(String, String)>,
    network_test_url: Option<Url>,
}

impl ForwardingHandler {
    pub fn new(events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            events,
            additional_params: Vec::new(),
            network_test_url: None,
        }
    }

    pub fn with_additional_params(mut self, params: Vec<(String, String)>) -> Self {
        self.additional_params = params;
        self
    }

    pub fn with_network_test_url(mut self, url: Url) -> Self {
        self.network_test_url = Some(url);
        self
    }

    fn emit(&self, event: ChannelEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.events.send(event);
    }
}

impl Handler for ForwardingHandler {
    fn channel_opened(&mut self) {
        self.emit(ChannelEvent::Opened);
    }

    fn channel_handle_array(&mut self, array: Value) -> Result<(), HandlerError> {
        self.events
            .send(ChannelEvent::Array(array))
            .map_err(|_| "event receiver dropped".into())
    }

    fn channel_success(&mut self, delivered: Vec<QueuedMap>) {
        if !delivered.is_empty() {
            self.emit(ChannelEvent::Delivered(delivered));
        }
    }

    fn channel_error(&mut self, error: ChannelError) {
        self.emit(ChannelEvent::Error(error));
    }

    fn channel_closed(&mut self, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        self.emit(ChannelEvent::Closed {
            pending,
            undelivered,
        });
    }

    fn additional_params(&mut self) -> Vec<(String, String)> {
        self.additional_params.clone()
    }

    fn network_test_image_uri(&self) -> Option<Url> {
        self.network_test_url.clone()
    }
}

/// Spawns the actor for a channel with `handler` on the current tokio
/// runtime. `cached` is the negotiation state of an earlier channel to the
/// same server, taken from its [`ChannelSnapshot`].
pub fn spawn(
    config: ChannelConfig,
    handler: Box<dyn Handler>,
    stats: Box<dyn StatsSink>,
    cached: Option<ConnectionState>,
) -> (WebChannelHandle, JoinHandle<()>) {
    let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let timers = TimerTable::default();

    let cx = ChannelContext::new(
        config,
        Box::new(ReqwestTransport::new(http::default_client(), inputs_tx.clone())),
        Box::new(TokioScheduler::new(timers.clone(), inputs_tx)),
        Box::new(SystemClock),
        stats,
        handler,
        Box::new(WireV8),
    );
    let mut channel = WebChannel::new(cx);
    if let Some(state) = cached {
        debug!(
            target = "webchannel.runtime",
            buffered = ?state.buffering_proxy_result,
            "reusing cached negotiation"
        );
        channel.set_connection_state(state);
    }
    let task = tokio::spawn(run(channel, timers, commands_rx, inputs_rx));
    (
        WebChannelHandle {
            commands: commands_tx,
        },
        task,
    )
}

/// Spawns the actor with a [`ForwardingHandler`] and returns its event stream.
pub fn spawn_with_events(
    config: ChannelConfig,
    stats: Box<dyn StatsSink>,
    cached: Option<ConnectionState>,
) -> (WebChannelHandle, mpsc::UnboundedReceiver<ChannelEvent>, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut handler = ForwardingHandler::new(events_tx);
    if let Some(url) = config.network_test_url.clone() {
        handler = handler.with_network_test_url(url);
    }
    let (handle, task) = spawn(config, Box::new(handler), stats, cached);
    (handle, events_rx, task)
}

async fn run(
    mut channel: WebChannel,
    timers: TimerTable,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut inputs: mpsc::UnboundedReceiver<DriverInput>,
) {
    debug!(target = "webchannel.runtime", "channel actor started");
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                match command {
                    Command::Connect(options, reply) => {
                        let _ = reply.send(channel.connect(options));
                    }
                    Command::SendMap(payload, context, reply) => {
                        let _ = reply.send(channel.send_map(payload, context));
                    }
                    Command::Disconnect(reply) => {
                        channel.disconnect();
                        let _ = reply.send(());
                    }
                    Command::BrowserOffline => channel.handle_browser_offline(),
                    Command::Snapshot(reply) => {
                        let _ = reply.send(ChannelSnapshot::of(&channel));
                    }
                }
            }
            Some(input) = inputs.recv() => match input {
                DriverInput::Transport { id, event } => channel.handle_transport_event(id, event),
                DriverInput::Timer { key, generation } => {
                    if timers.claim(key, generation) {
                        channel.handle_timer(key);
                    }
                }
                DriverInput::NetworkTest { up } => channel.handle_network_test_result(up),
            },
        }
    }
    info!(target = "webchannel.runtime", state = ?channel.state(), "all handles dropped; shutting down channel");
    channel.disconnect();
    timers.clear();
}
