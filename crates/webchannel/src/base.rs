//! Session state machine: queues, forward and back channel lifecycle, retry
//! policy and dead back-channel detection.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::channel::{dispatch_timer, dispatch_transport_event, Channel};
use crate::config::ChannelConfig;
use crate::context::ChannelContext;
use crate::error::{ChannelError, RequestError, WebChannelError, WebChannelResult};
use crate::handler::{MapContext, QueuedMap};
use crate::pool::ForwardChannelRequestPool;
use crate::request::{ChannelRequest, RequestKind, Rid};
use crate::stats::Stat;
use crate::test_channel::{BaseTestChannel, TestOutcome, CLIENT_PROTOCOL_HEADER, HTTP_SESSION_ID_HEADER};
use crate::transport::{RequestId, TimerKey, TransportEvent};
use crate::uri;

pub const BACK_CHANNEL_MAX_RETRIES: u32 = 3;

/// Round trip estimate used by the back-channel liveness checks.
pub const RTT_ESTIMATE: Duration = Duration::from_millis(3_000);

/// Above this many unacknowledged back-channel bytes the back channel is
/// assumed busy rather than dead.
pub const OUTSTANDING_DATA_BACKCHANNEL_RETRY_CUTOFF: i64 = 37_500;

const INITIAL_RID_RANGE: u64 = 100_000;
const INACTIVE_CHANNEL_RETRY_FACTOR: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Init,
    Opening,
    Opened,
}

/// A forward request waiting on the retry timer: its wire id and the maps it
/// carried, which stay pending until the retry is sent.
/// True for the first map that no longer fits in one forward request. Later
/// maps of the same backlog do not match again.
fn overflows_request(queued: usize, max_maps: usize) -> bool {
    queued == max_maps
}

#[derive(Debug, Clone)]
struct ForwardRetry {
    rid: u64,
    map_ids: Vec<u64>,
}

#[derive(Debug)]
pub struct WebChannelBase {
    state: ChannelState,

    sid: String,
    channel_version: u32,
    server_version: Option<i64>,
    host_prefix: Option<String>,

    channel_path: String,
    forward_uri: Option<Url>,
    back_uri: Option<Url>,
    extra_params: Vec<(String, String)>,

    next_map_id: u64,
    next_rid: u64,
    outgoing_maps: VecDeque<QueuedMap>,
    pending_maps: Vec<QueuedMap>,

    test: Option<BaseTestChannel>,
    back_channel: Option<ChannelRequest>,
    pool: ForwardChannelRequestPool,

    forward_timer_armed: bool,
    forward_retry: Option<ForwardRetry>,
    forward_retry_count: u32,
    back_timer_armed: bool,
    back_retry_count: u32,
    back_attempt_id: u32,
    dead_backchannel_armed: bool,

    use_chunked: bool,
    last_array_id: i64,
    last_post_response_array_id: i64,
    last_status_code: Option<u16>,
    back_channel_timeout: Option<Duration>,
}

impl WebChannelBase {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            state: ChannelState::Init,
            sid: String::new(),
            channel_version: config.channel_version,
            server_version: None,
            host_prefix: None,
            channel_path: String::new(),
            forward_uri: None,
            back_uri: None,
            extra_params: Vec::new(),
            next_map_id: 0,
            next_rid: 0,
            outgoing_maps: VecDeque::new(),
            pending_maps: Vec::new(),
            test: None,
            back_channel: None,
            pool: ForwardChannelRequestPool::new(config.max_pool_size),
            forward_timer_armed: false,
            forward_retry: None,
            forward_retry_count: 0,
            back_timer_armed: false,
            back_retry_count: 0,
            back_attempt_id: 0,
            dead_backchannel_armed: false,
            use_chunked: false,
            last_array_id: -1,
            last_post_response_array_id: -1,
            last_status_code: None,
            back_channel_timeout: config.back_channel_request_timeout,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session_id(&self) -> &str {
        &self.sid
    }

    pub fn channel_version(&self) -> u32 {
        self.channel_version
    }

    pub fn server_version(&self) -> Option<i64> {
        self.server_version
    }

    pub fn host_prefix(&self) -> Option<&str> {
        self.host_prefix.as_deref()
    }

    pub fn last_array_id(&self) -> i64 {
        self.last_array_id
    }

    pub fn last_post_response_array_id(&self) -> i64 {
        self.last_post_response_array_id
    }

    pub fn last_status_code(&self) -> Option<u16> {
        self.last_status_code
    }

    /// True when a buffering proxy forced non-chunked back-channel responses.
    pub fn is_buffered(&self) -> bool {
        !self.use_chunked
    }

    pub fn back_channel_timeout(&self) -> Option<Duration> {
        self.back_channel_timeout
    }

    pub fn outgoing_map_count(&self) -> usize {
        self.outgoing_maps.len()
    }

    pub fn pending_map_count(&self) -> usize {
        self.pending_maps.len()
    }

    pub fn forward_channel_pool(&self) -> &ForwardChannelRequestPool {
        &self.pool
    }

    pub fn back_channel_request_id(&self) -> Option<RequestId> {
        self.back_channel.as_ref().map(ChannelRequest::id)
    }

    /// Starts the connection test and, once it passes, the session.
    ///
    /// `old_session` carries the id and last array id of a previous session
    /// the server may resume from.
    pub fn connect(
        &mut self,
        cx: &mut ChannelContext,
        test_path: &str,
        channel_path: &str,
        extra_params: Vec<(String, String)>,
        old_session: Option<(String, i64)>,
    ) -> WebChannelResult<()> {
        if self.state != ChannelState::Init || self.forward_uri.is_some() {
            return Err(WebChannelError::InvalidState(self.state));
        }
        uri::data_uri(cx.config.base_url.as_ref(), test_path, None)?;
        let mut forward_uri = uri::data_uri(cx.config.base_url.as_ref(), channel_path, None)?;
        uri::set_param(
            &mut forward_uri,
            "VER",
            &self.channel_version.to_string(),
        );

        info!(target = "webchannel.base", test_path, channel_path, "connecting");
        cx.stats.stat(Stat::ConnectAttempt);

        self.channel_path = channel_path.to_string();
        self.forward_uri = Some(forward_uri);
        self.extra_params = extra_params;
        if let Some((sid, aid)) = old_session {
            self.extra_params.push(("OSID".to_string(), sid));
            self.extra_params.push(("OAID".to_string(), aid.to_string()));
        }
        self.next_rid = cx.rng.gen_range(0..INITIAL_RID_RANGE);

        if let Err(error) = cx.handler.ok_to_make_request() {
            debug!(target = "webchannel.base", error = %error, "handler refused the connection");
            self.signal_error(cx, error);
            return Ok(());
        }

        let mut params = vec![("VER".to_string(), self.channel_version.to_string())];
        params.extend(cx.handler.additional_params());
        let mut test = BaseTestChannel::new();
        test.connect(cx, test_path, params)?;
        self.test = Some(test);
        // Cached results can finish the test without any request.
        self.poll_test_outcome(cx);
        Ok(())
    }

    /// Queues a map for the forward channel.
    pub fn send_map(
        &mut self,
        cx: &mut ChannelContext,
        payload: Value,
        context: Option<MapContext>,
    ) -> WebChannelResult<()> {
        if self.state == ChannelState::Closed {
            return Err(WebChannelError::Closed);
        }
        if overflows_request(self.outgoing_maps.len(), cx.config.max_maps_per_request) {
            warn!(
                target = "webchannel.base",
                queued = self.outgoing_maps.len(),
                "outgoing queue exceeds one request; further maps wait for another flush"
            );
        }
        let map = QueuedMap::new(self.next_map_id, payload, context);
        self.next_map_id += 1;
        self.outgoing_maps.push_back(map);
        if matches!(self.state, ChannelState::Opening | ChannelState::Opened) {
            self.ensure_forward_channel(cx);
        }
        Ok(())
    }

    /// Closes the channel, telling the server when a session is open.
    pub fn disconnect(&mut self, cx: &mut ChannelContext) {
        if self.state == ChannelState::Closed {
            return;
        }
        info!(target = "webchannel.base", state = ?self.state, "disconnecting");
        self.cancel_requests(cx);
        if self.state == ChannelState::Opened {
            if let Some(mut url) = self.forward_uri.clone() {
                let rid = self.take_rid();
                uri::set_param(&mut url, "SID", &self.sid);
                uri::set_param(&mut url, "RID", &rid.to_string());
                uri::set_param(&mut url, "TYPE", "terminate");
                uri::set_params(&mut url, &cx.handler.additional_params());
                let mut request = ChannelRequest::new(cx, RequestKind::Close, Rid::Num(rid), 0);
                request.send_close_request(cx, url);
            }
        }
        self.on_close(cx);
    }

    /// Fails every forward request in flight as offline, through the normal
    /// completion path.
    pub fn on_browser_offline(&mut self, cx: &mut ChannelContext) {
        if self.state == ChannelState::Closed {
            return;
        }
        info!(target = "webchannel.base", "client went offline");
        for id in self.pool.force_complete(cx, RequestError::BrowserOffline) {
            if self.state == ChannelState::Closed {
                break;
            }
            self.on_request_complete(cx, id);
        }
    }

    pub fn handle_network_test_result(&mut self, cx: &mut ChannelContext, up: bool) {
        debug!(target = "webchannel.base", up, "network test finished");
        cx.stats
            .stat(if up { Stat::NetworkUp } else { Stat::NetworkDown });
    }

    pub fn handle_transport_event(
        &mut self,
        cx: &mut ChannelContext,
        id: RequestId,
        event: TransportEvent,
    ) {
        if let Some(test) = self.test.as_mut() {
            if test.tracks_request(id) {
                dispatch_transport_event(test, cx, id, event);
                self.poll_test_outcome(cx);
                return;
            }
        }
        dispatch_transport_event(self, cx, id, event);
    }

    pub fn handle_timer(&mut self, cx: &mut ChannelContext, key: TimerKey) {
        match key {
            TimerKey::ForwardChannel => self.on_forward_channel_timer(cx),
            TimerKey::BackChannel => self.on_back_channel_timer(cx),
            TimerKey::DeadBackChannel => self.on_back_channel_dead(cx),
            TimerKey::Watchdog(id) | TimerKey::Poll(id) | TimerKey::Throttle(id) => {
                if let Some(test) = self.test.as_mut() {
                    if test.tracks_request(id) {
                        dispatch_timer(test, cx, key);
                        self.poll_test_outcome(cx);
                        return;
                    }
                }
                dispatch_timer(self, cx, key);
            }
        }
    }

    fn poll_test_outcome(&mut self, cx: &mut ChannelContext) {
        let Some(outcome) = self.test.as_mut().and_then(BaseTestChannel::take_outcome) else {
            return;
        };
        let Some(test) = self.test.take() else {
            return;
        };
        self.last_status_code = test.last_status_code();
        match outcome {
            TestOutcome::Finished { use_chunked } => {
                self.pool.apply_client_protocol(test.client_protocol());
                self.use_chunked = cx.config.allow_chunked_mode && use_chunked;
                cx.connection_state.buffering_proxy_result = Some(!use_chunked);
                info!(
                    target = "webchannel.base",
                    use_chunked = self.use_chunked,
                    pool_size = self.pool.max_size(),
                    "connection test passed"
                );
                self.ensure_forward_channel(cx);
            }
            TestOutcome::Failed(error) => {
                warn!(target = "webchannel.base", error = %error, "connection test failed");
                self.signal_error(cx, ChannelError::from_request_error(error));
            }
        }
    }

    fn take_rid(&mut self) -> u64 {
        let rid = self.next_rid;
        self.next_rid += 1;
        rid
    }

    fn ensure_forward_channel(&mut self, cx: &mut ChannelContext) {
        if self.pool.is_full() || self.forward_timer_armed {
            return;
        }
        cx.scheduler.schedule(TimerKey::ForwardChannel, Duration::ZERO);
        self.forward_timer_armed = true;
        self.forward_retry_count = 0;
    }

    fn on_forward_channel_timer(&mut self, cx: &mut ChannelContext) {
        self.forward_timer_armed = false;
        let retry = self.forward_retry.take();
        match self.state {
            ChannelState::Init => {
                if retry.is_some() {
                    warn!(target = "webchannel.base", "forward retry fired before the channel opened");
                    return;
                }
                self.open(cx, None);
            }
            ChannelState::Opening => {
                if let Some(retry) = retry {
                    self.requeue_maps(&retry.map_ids);
                    self.open(cx, Some(retry.rid));
                }
            }
            ChannelState::Opened => {
                if let Some(retry) = retry {
                    self.make_forward_channel_request(cx, Some(retry));
                    return;
                }
                if self.outgoing_maps.is_empty() || self.pool.is_full() {
                    return;
                }
                self.make_forward_channel_request(cx, None);
            }
            ChannelState::Closed => {}
        }
    }

    /// Sends the session-creating POST.
    fn open(&mut self, cx: &mut ChannelContext, retry_rid: Option<u64>) {
        let Some(mut url) = self.forward_uri.clone() else {
            return;
        };
        let rid = retry_rid.unwrap_or_else(|| self.take_rid());
        debug!(target = "webchannel.base", rid, retry = retry_rid.is_some(), "opening session");

        uri::set_param(&mut url, "RID", &rid.to_string());
        if let Some(version) = cx.config.client_version.as_deref() {
            uri::set_param(&mut url, "CVER", version);
        }
        if let Some(param) = cx.config.http_session_id_param.as_deref() {
            uri::set_param(&mut url, HTTP_SESSION_ID_HEADER, param);
        }
        uri::set_params(&mut url, &self.extra_params);
        uri::set_params(&mut url, &cx.handler.additional_params());

        let mut request = ChannelRequest::new(
            cx,
            RequestKind::Forward,
            Rid::Num(rid),
            self.forward_retry_count + 1,
        );
        request.set_extra_headers(cx.config.init_headers.clone());
        let max_maps = cx.config.max_maps_per_request;
        let (body, map_ids) = self.dequeue_outgoing_maps(cx, max_maps);
        request.set_pending_map_ids(map_ids);
        request.xml_http_post(cx, url, body, true);
        self.add_forward_request(cx, request);
        self.state = ChannelState::Opening;
    }

    fn make_forward_channel_request(&mut self, cx: &mut ChannelContext, retry: Option<ForwardRetry>) {
        let Some(mut url) = self.forward_uri.clone() else {
            return;
        };
        let rid = match retry {
            Some(retry) => {
                self.requeue_maps(&retry.map_ids);
                retry.rid
            }
            None => self.take_rid(),
        };

        uri::set_param(&mut url, "SID", &self.sid);
        uri::set_param(&mut url, "RID", &rid.to_string());
        uri::set_param(&mut url, "AID", &self.last_array_id.to_string());
        uri::set_params(&mut url, &cx.handler.additional_params());
        if let (Some(param), Some(value)) = (
            cx.config.http_session_id_param.as_deref(),
            cx.http_session_id.as_deref(),
        ) {
            uri::set_param(&mut url, param, value);
        }

        let mut request = ChannelRequest::new(
            cx,
            RequestKind::Forward,
            Rid::Num(rid),
            self.forward_retry_count + 1,
        );
        let max_maps = cx.config.max_maps_per_request;
        let (body, map_ids) = self.dequeue_outgoing_maps(cx, max_maps);
        request.set_pending_map_ids(map_ids);
        request.set_timeout(Self::forward_request_timeout(cx));
        debug!(
            target = "webchannel.base",
            rid,
            maps = request.pending_map_ids().len(),
            retry = self.forward_retry_count,
            "sending forward request"
        );
        request.xml_http_post(cx, url, body, true);
        self.add_forward_request(cx, request);
    }

    fn add_forward_request(&mut self, cx: &mut ChannelContext, request: ChannelRequest) {
        if let Err(mut rejected) = self.pool.add_request(request) {
            warn!(target = "webchannel.base", id = %rejected.id(), "forward pool full; dropping request");
            let ids = rejected.pending_map_ids().to_vec();
            rejected.cancel(cx);
            self.requeue_maps(&ids);
        }
    }

    /// Forward requests time out somewhere in the upper half of the configured
    /// timeout so a burst of retries does not expire together.
    fn forward_request_timeout(cx: &mut ChannelContext) -> Duration {
        let half = cx.config.forward_channel_request_timeout / 2;
        half + half.mul_f64(cx.rng.gen::<f64>())
    }

    /// Moves up to `max` maps from the outgoing queue to the pending list and
    /// encodes them.
    fn dequeue_outgoing_maps(&mut self, cx: &mut ChannelContext, max: usize) -> (String, Vec<u64>) {
        let count = self.outgoing_maps.len().min(max);
        let batch: Vec<QueuedMap> = self.outgoing_maps.drain(..count).collect();
        let handler = &mut cx.handler;
        let body = cx
            .codec
            .encode_message_queue(&batch, count, &mut |map| handler.bad_map_error(map));
        let ids = batch.iter().map(|m| m.map_id).collect();
        self.pending_maps.extend(batch);
        (body, ids)
    }

    /// Moves the given pending maps back into the outgoing queue. The queue
    /// stays ordered by map id whichever request failed first.
    fn requeue_maps(&mut self, map_ids: &[u64]) {
        if map_ids.is_empty() {
            return;
        }
        let (mut requeued, kept): (Vec<QueuedMap>, Vec<QueuedMap>) = std::mem::take(&mut self.pending_maps)
            .into_iter()
            .partition(|m| map_ids.contains(&m.map_id));
        self.pending_maps = kept;
        requeued.sort_by_key(|m| m.map_id);
        let mut requeued = requeued.into_iter().peekable();
        let mut queued = std::mem::take(&mut self.outgoing_maps).into_iter().peekable();
        while let (Some(a), Some(b)) = (requeued.peek(), queued.peek()) {
            let take_requeued = a.map_id <= b.map_id;
            let next = if take_requeued {
                requeued.next()
            } else {
                queued.next()
            };
            self.outgoing_maps.extend(next);
        }
        self.outgoing_maps.extend(requeued);
        self.outgoing_maps.extend(queued);
    }

    fn take_pending(&mut self, map_ids: &[u64]) -> Vec<QueuedMap> {
        let (taken, kept): (Vec<QueuedMap>, Vec<QueuedMap>) = std::mem::take(&mut self.pending_maps)
            .into_iter()
            .partition(|m| map_ids.contains(&m.map_id));
        self.pending_maps = kept;
        taken
    }

    fn retry_delay(&self, cx: &mut ChannelContext, retry_count: u32) -> Duration {
        let seed = cx.config.retry_delay_seed.as_millis() as u64;
        let jitter = if seed > 0 { cx.rng.gen_range(0..seed) } else { 0 };
        let mut millis = cx.config.base_retry_delay.as_millis() as u64 + jitter;
        if !cx.handler.is_active() {
            millis *= INACTIVE_CHANNEL_RETRY_FACTOR;
        }
        Duration::from_millis(millis * u64::from(retry_count))
    }

    fn maybe_retry_forward_channel(&mut self, cx: &mut ChannelContext, request: &ChannelRequest) -> bool {
        if self.forward_timer_armed {
            // A flush is already scheduled; it carries these maps.
            self.requeue_maps(request.pending_map_ids());
            return true;
        }
        if self.pool.is_full() {
            return false;
        }
        if self.state == ChannelState::Init
            || self.forward_retry_count >= cx.config.effective_forward_max_retries()
        {
            return false;
        }
        let delay = self.retry_delay(cx, self.forward_retry_count);
        let Rid::Num(rid) = request.rid() else {
            return false;
        };
        debug!(
            target = "webchannel.base",
            rid,
            attempt = self.forward_retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying forward request"
        );
        self.forward_retry = Some(ForwardRetry {
            rid,
            map_ids: request.pending_map_ids().to_vec(),
        });
        cx.scheduler.schedule(TimerKey::ForwardChannel, delay);
        self.forward_timer_armed = true;
        self.forward_retry_count += 1;
        true
    }

    fn ensure_back_channel(&mut self, cx: &mut ChannelContext) {
        if self.back_channel.is_some() || self.back_timer_armed {
            return;
        }
        self.back_attempt_id = 1;
        cx.scheduler.schedule(TimerKey::BackChannel, Duration::ZERO);
        self.back_timer_armed = true;
        self.back_retry_count = 0;
    }

    fn maybe_retry_back_channel(&mut self, cx: &mut ChannelContext) -> bool {
        if self.back_channel.is_some() || self.back_timer_armed {
            return false;
        }
        if self.back_retry_count >= BACK_CHANNEL_MAX_RETRIES {
            return false;
        }
        self.back_attempt_id += 1;
        let delay = self.retry_delay(cx, self.back_retry_count);
        debug!(
            target = "webchannel.base",
            attempt = self.back_attempt_id,
            delay_ms = delay.as_millis() as u64,
            "retrying back channel"
        );
        cx.scheduler.schedule(TimerKey::BackChannel, delay);
        self.back_timer_armed = true;
        self.back_retry_count += 1;
        true
    }

    fn on_back_channel_timer(&mut self, cx: &mut ChannelContext) {
        self.back_timer_armed = false;
        if self.state != ChannelState::Opened {
            return;
        }
        if let Err(error) = cx.handler.ok_to_make_request() {
            self.signal_error(cx, error);
            return;
        }
        let Some(mut url) = self.back_uri.clone() else {
            return;
        };
        uri::set_param(&mut url, "RID", &Rid::Rpc.to_string());
        uri::set_param(&mut url, "SID", &self.sid);
        uri::set_param(&mut url, "CI", if self.use_chunked { "0" } else { "1" });
        uri::set_param(&mut url, "AID", &self.last_array_id.to_string());
        uri::set_params(&mut url, &cx.handler.additional_params());
        uri::set_param(&mut url, "TYPE", "xmlhttp");
        if let (Some(param), Some(value)) = (
            cx.config.http_session_id_param.as_deref(),
            cx.http_session_id.as_deref(),
        ) {
            uri::set_param(&mut url, param, value);
        }

        let mut request = ChannelRequest::new(cx, RequestKind::Back, Rid::Rpc, self.back_attempt_id);
        if let Some(timeout) = self.back_channel_timeout {
            request.set_timeout(timeout);
        }
        debug!(target = "webchannel.base", id = %request.id(), attempt = self.back_attempt_id, "starting back channel");
        request.xml_http_get(cx, url, true);
        self.back_channel = Some(request);
    }

    fn clear_dead_backchannel_timer(&mut self, cx: &mut ChannelContext) {
        if self.dead_backchannel_armed {
            cx.scheduler.cancel(TimerKey::DeadBackChannel);
            self.dead_backchannel_armed = false;
        }
    }

    fn on_back_channel_dead(&mut self, cx: &mut ChannelContext) {
        if !self.dead_backchannel_armed {
            return;
        }
        self.dead_backchannel_armed = false;
        warn!(target = "webchannel.base", "back channel went quiet; replacing it");
        if let Some(mut back) = self.back_channel.take() {
            back.cancel(cx);
        }
        self.maybe_retry_back_channel(cx);
        cx.stats.stat(Stat::BackchannelDead);
    }

    fn should_retry_back_channel(&self, outstanding_bytes: i64) -> bool {
        outstanding_bytes < OUTSTANDING_DATA_BACKCHANNEL_RETRY_CUTOFF
            && !self.is_buffered()
            && self.back_retry_count == 0
    }

    /// Forward acknowledgement `[back_channel_present, last_array_id,
    /// outstanding_bytes]`.
    fn handle_post_response(&mut self, cx: &mut ChannelContext, forward_id: RequestId, response: &[Value]) {
        if response[0].as_i64() == Some(0) {
            self.handle_backchannel_missing(cx, forward_id);
            return;
        }
        self.last_post_response_array_id = response[1].as_i64().unwrap_or(-1);
        let outstanding_arrays = self.last_post_response_array_id - self.last_array_id;
        if outstanding_arrays > 0 {
            let outstanding_bytes = response[2].as_i64().unwrap_or(0);
            if self.should_retry_back_channel(outstanding_bytes) && !self.dead_backchannel_armed {
                debug!(
                    target = "webchannel.base",
                    outstanding_arrays,
                    outstanding_bytes,
                    "arming dead back channel timer"
                );
                cx.scheduler
                    .schedule(TimerKey::DeadBackChannel, RTT_ESTIMATE * 2);
                self.dead_backchannel_armed = true;
            }
        }
    }

    fn handle_backchannel_missing(&mut self, cx: &mut ChannelContext, forward_id: RequestId) {
        debug!(target = "webchannel.base", "server reports no back channel");
        if let Some(back) = self.back_channel.as_ref() {
            let forward_start = self.pool.get(forward_id).and_then(ChannelRequest::start_time);
            let stale = match (back.start_time(), forward_start) {
                (Some(back_start), Some(forward_start)) => back_start + RTT_ESTIMATE < forward_start,
                _ => false,
            };
            if !stale {
                return;
            }
            self.clear_dead_backchannel_timer(cx);
            if let Some(mut back) = self.back_channel.take() {
                back.cancel(cx);
            }
        } else {
            warn!(target = "webchannel.base", "back channel missing while none is open");
        }
        self.maybe_retry_back_channel(cx);
        cx.stats.stat(Stat::BackchannelMissing);
    }

    fn apply_control_headers(&mut self, cx: &mut ChannelContext, request_id: RequestId) {
        let Some(request) = self.pool.get(request_id) else {
            return;
        };
        let protocol = request.response_header(CLIENT_PROTOCOL_HEADER).map(str::to_string);
        let session = request.response_header(HTTP_SESSION_ID_HEADER).map(str::to_string);
        if protocol.is_some() {
            self.pool.apply_client_protocol(protocol.as_deref());
        }
        let Some(param) = cx.config.http_session_id_param.clone() else {
            return;
        };
        match session {
            Some(session) => {
                if let Some(url) = self.forward_uri.as_mut() {
                    uri::set_param(url, &param, &session);
                }
                cx.http_session_id = Some(session);
            }
            None => warn!(
                target = "webchannel.base",
                header = HTTP_SESSION_ID_HEADER,
                "session id header missing from handshake response"
            ),
        }
    }

    fn on_control_array(&mut self, cx: &mut ChannelContext, request_id: RequestId, control: &[Value]) {
        self.sid = control.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
        self.host_prefix = cx.correct_host_prefix(control.get(2).and_then(Value::as_str));
        if let Some(version) = control.get(3).and_then(Value::as_u64) {
            self.channel_version = version as u32;
        }
        if let Some(server_version) = control.get(4).and_then(Value::as_i64) {
            self.server_version = Some(server_version);
        }
        if let Some(keepalive) = control.get(5).and_then(Value::as_f64).filter(|ms| *ms > 0.0) {
            self.back_channel_timeout = Some(Duration::from_millis((keepalive * 1.5) as u64));
        }
        self.apply_control_headers(cx, request_id);

        self.state = ChannelState::Opened;
        info!(
            target = "webchannel.base",
            sid = %self.sid,
            version = self.channel_version,
            host_prefix = ?self.host_prefix,
            "channel opened"
        );
        cx.handler.channel_opened();

        let prefix = if cx.config.supports_cross_domain {
            self.host_prefix.as_deref()
        } else {
            None
        };
        let back_uri = uri::data_uri(cx.config.base_url.as_ref(), &self.channel_path, prefix)
            .or_else(|err| {
                warn!(target = "webchannel.base", error = %err, "cannot apply host prefix to back channel");
                uri::data_uri(cx.config.base_url.as_ref(), &self.channel_path, None)
            });
        match back_uri {
            Ok(mut url) => {
                uri::set_param(&mut url, "VER", &self.channel_version.to_string());
                self.back_uri = Some(url);
            }
            Err(err) => warn!(target = "webchannel.base", error = %err, "no back channel url"),
        }
        self.ensure_back_channel(cx);
        if !self.outgoing_maps.is_empty() {
            self.ensure_forward_channel(cx);
        }
    }

    fn deliver_array(&mut self, cx: &mut ChannelContext, request_id: RequestId, array: Value) {
        if let Err(err) = cx.handler.channel_handle_array(array) {
            self.note_handler_failure(cx, request_id, &*err);
        }
    }

    fn flush_batch(&mut self, cx: &mut ChannelContext, request_id: RequestId, batch: &mut Vec<Value>) {
        if batch.is_empty() {
            return;
        }
        if let Err(err) = cx.handler.channel_handle_multiple_arrays(std::mem::take(batch)) {
            self.note_handler_failure(cx, request_id, &*err);
        }
    }

    fn note_handler_failure(
        &mut self,
        cx: &mut ChannelContext,
        request_id: RequestId,
        err: &(dyn std::error::Error + Send + Sync),
    ) {
        warn!(target = "webchannel.base", error = %err, "handler failed on server data");
        cx.stats.stat(Stat::HandlerException);
        if let Some(request) = self.request_mut(request_id) {
            request.note_handler_exception();
        }
    }

    /// Processes decoded `[array_id, payload]` pairs from a response.
    fn on_input(&mut self, cx: &mut ChannelContext, request_id: RequestId, arrays: Vec<Value>) {
        let batched = cx.handler.supports_batched_arrays();
        let mut batch = Vec::new();
        for entry in arrays {
            if self.state == ChannelState::Closed {
                return;
            }
            let Value::Array(mut pair) = entry else {
                warn!(target = "webchannel.base", "server array is not an [id, payload] pair");
                break;
            };
            if pair.len() < 2 {
                warn!(target = "webchannel.base", "server array is not an [id, payload] pair");
                break;
            }
            if let Some(array_id) = pair[0].as_i64() {
                self.last_array_id = array_id;
            }
            let payload = pair.swap_remove(1);
            let control = payload
                .as_array()
                .and_then(|items| items.first())
                .and_then(Value::as_str)
                .map(str::to_string);

            match self.state {
                ChannelState::Opening => match control.as_deref() {
                    Some("c") => {
                        let fields = payload.as_array().cloned().unwrap_or_default();
                        self.on_control_array(cx, request_id, &fields);
                    }
                    Some("stop") | Some("close") => self.signal_error(cx, ChannelError::Stop),
                    _ => debug!(target = "webchannel.base", "ignoring array before the channel opened"),
                },
                ChannelState::Opened => {
                    match control.as_deref() {
                        Some(word @ ("stop" | "close")) => {
                            self.flush_batch(cx, request_id, &mut batch);
                            if word == "stop" {
                                self.signal_error(cx, ChannelError::Stop);
                            } else {
                                self.disconnect(cx);
                            }
                        }
                        Some("noop") => {}
                        _ => {
                            if batched {
                                batch.push(payload);
                            } else {
                                self.deliver_array(cx, request_id, payload);
                            }
                        }
                    }
                    self.back_retry_count = 0;
                }
                ChannelState::Init | ChannelState::Closed => {}
            }
        }
        if self.state != ChannelState::Closed {
            self.flush_batch(cx, request_id, &mut batch);
        }
    }

    fn signal_error(&mut self, cx: &mut ChannelContext, error: ChannelError) {
        if self.state == ChannelState::Closed {
            return;
        }
        warn!(target = "webchannel.base", error = %error, code = error.code(), "channel error");
        if error == ChannelError::RequestFailed {
            let probe = cx
                .handler
                .network_test_image_uri()
                .or_else(|| cx.config.network_test_url.clone());
            cx.transport.test_network(probe);
            cx.stats.stat(Stat::ErrorNetwork);
        } else {
            cx.stats.stat(Stat::ErrorOther);
        }
        self.state = ChannelState::Closed;
        cx.handler.channel_error(error);
        self.cancel_requests(cx);
        self.on_close(cx);
    }

    fn on_close(&mut self, cx: &mut ChannelContext) {
        self.state = ChannelState::Closed;
        let pending = std::mem::take(&mut self.pending_maps);
        let undelivered: Vec<QueuedMap> = std::mem::take(&mut self.outgoing_maps).into();
        info!(
            target = "webchannel.base",
            pending = pending.len(),
            undelivered = undelivered.len(),
            "channel closed"
        );
        cx.handler.channel_closed(pending, undelivered);
    }

    fn cancel_requests(&mut self, cx: &mut ChannelContext) {
        if let Some(mut test) = self.test.take() {
            test.abort(cx);
        }
        if let Some(mut back) = self.back_channel.take() {
            back.cancel(cx);
        }
        if self.back_timer_armed {
            cx.scheduler.cancel(TimerKey::BackChannel);
            self.back_timer_armed = false;
        }
        self.clear_dead_backchannel_timer(cx);
        self.pool.cancel(cx);
        if self.forward_timer_armed {
            cx.scheduler.cancel(TimerKey::ForwardChannel);
            self.forward_timer_armed = false;
        }
        self.forward_retry = None;
    }

    fn is_fatal(error: RequestError, status: Option<u16>) -> bool {
        error == RequestError::UnknownSessionId
            || (error == RequestError::Status && status.is_some_and(|code| code > 0))
    }
}

impl Channel for WebChannelBase {
    fn request_mut(&mut self, id: RequestId) -> Option<&mut ChannelRequest> {
        match self.back_channel.as_mut() {
            Some(back) if back.id() == id => Some(back),
            _ => self.pool.get_mut(id),
        }
    }

    fn tracks_request(&self, id: RequestId) -> bool {
        self.back_channel.as_ref().is_some_and(|r| r.id() == id) || self.pool.has_request(id)
    }

    fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    fn on_request_data(&mut self, cx: &mut ChannelContext, id: RequestId, data: &str) {
        if self.state == ChannelState::Closed {
            return;
        }
        if self.pool.has_request(id) && self.state == ChannelState::Opened {
            match cx.codec.decode_message(data) {
                Ok(response) if response.len() == 3 => self.handle_post_response(cx, id, &response),
                Ok(response) => {
                    warn!(target = "webchannel.base", len = response.len(), "bad forward response");
                    self.signal_error(cx, ChannelError::BadResponse);
                }
                Err(err) => {
                    warn!(target = "webchannel.base", error = %err, "undecodable forward response");
                    self.signal_error(cx, ChannelError::BadResponse);
                }
            }
            return;
        }

        if self.back_channel.as_ref().is_some_and(|r| r.id() == id) {
            self.clear_dead_backchannel_timer(cx);
        }
        if data.trim().is_empty() {
            return;
        }
        match cx.codec.decode_message(data) {
            Ok(arrays) => self.on_input(cx, id, arrays),
            Err(err) => warn!(target = "webchannel.base", id = %id, error = %err, "undecodable server data"),
        }
    }

    fn on_request_complete(&mut self, cx: &mut ChannelContext, id: RequestId) {
        if self.state == ChannelState::Closed {
            return;
        }
        let (request, kind) = match self.back_channel.take() {
            Some(back) if back.id() == id => (back, RequestKind::Back),
            other => {
                self.back_channel = other;
                match self.pool.remove_request(id) {
                    Some(request) => (request, RequestKind::Forward),
                    None => return,
                }
            }
        };
        self.last_status_code = request.status();

        if request.success() {
            if kind == RequestKind::Forward {
                if let Some(start) = request.start_time() {
                    let size = request.post_data().map_or(0, str::len);
                    let rtt = cx.clock.now().saturating_duration_since(start);
                    cx.stats.timing(size, rtt, self.forward_retry_count);
                }
                self.ensure_forward_channel(cx);
                let delivered = self.take_pending(request.pending_map_ids());
                cx.handler.channel_success(delivered);
            } else {
                self.ensure_back_channel(cx);
            }
            return;
        }

        let error = request.last_error().unwrap_or(RequestError::Status);
        debug!(
            target = "webchannel.base",
            id = %id,
            kind = kind.as_str(),
            error = %error.describe(request.status()),
            "request failed"
        );
        if !Self::is_fatal(error, request.status()) {
            let retried = match kind {
                RequestKind::Forward => self.maybe_retry_forward_channel(cx, &request),
                _ => self.maybe_retry_back_channel(cx),
            };
            if retried {
                return;
            }
        }
        self.signal_error(cx, ChannelError::from_request_error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{frame, harness, Harness};
    use crate::transport::{Completion, HttpRequest, Method};
    use bytes::Bytes;
    use serde_json::json;

    fn config() -> ChannelConfig {
        let mut config = ChannelConfig::default();
        config.base_url = Some(Url::parse("http://example.com/").unwrap());
        config
    }

    fn respond<S: AsRef<str>>(
        base: &mut WebChannelBase,
        h: &mut Harness,
        id: RequestId,
        status: u16,
        parts: &[S],
        finish: bool,
    ) {
        base.handle_transport_event(&mut h.cx, id, TransportEvent::Head { status, headers: vec![] });
        for part in parts {
            data(base, h, id, part.as_ref());
        }
        if finish {
            base.handle_transport_event(&mut h.cx, id, TransportEvent::Complete(Completion::Finished));
        }
    }

    fn data(base: &mut WebChannelBase, h: &mut Harness, id: RequestId, text: &str) {
        base.handle_transport_event(
            &mut h.cx,
            id,
            TransportEvent::Data(Bytes::copy_from_slice(text.as_bytes())),
        );
    }

    fn fail(base: &mut WebChannelBase, h: &mut Harness, id: RequestId) {
        base.handle_transport_event(
            &mut h.cx,
            id,
            TransportEvent::Complete(Completion::Failed("connection refused".into())),
        );
    }

    fn fire(base: &mut WebChannelBase, h: &mut Harness, key: TimerKey) {
        assert!(h.scheduler.fire(key), "{key:?} is not armed");
        base.handle_timer(&mut h.cx, key);
    }

    fn last(h: &Harness) -> (RequestId, HttpRequest) {
        h.transport.last_sent().expect("a request was sent")
    }

    /// Runs the test channel (unbuffered) and the handshake up to `Opened`
    /// with the back channel started.
    fn open(base: &mut WebChannelBase, h: &mut Harness) {
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(h);
        respond(base, h, init, 200, &[r#"[null]"#], true);
        let (probe, _) = last(h);
        respond(base, h, probe, 200, &["11111", "2"], true);
        fire(base, h, TimerKey::ForwardChannel);
        let (handshake, _) = last(h);
        respond(base, h, handshake, 200, &[&frame(r#"[[0,["c","SID1",null,8,1]]]"#)], true);
        assert_eq!(base.state(), ChannelState::Opened);
        fire(base, h, TimerKey::BackChannel);
    }

    #[test]
    fn connect_twice_is_rejected() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        assert!(matches!(
            base.connect(&mut h.cx, "/test", "/channel", vec![], None),
            Err(WebChannelError::InvalidState(ChannelState::Init))
        ));
        assert_eq!(h.stats.count(Stat::ConnectAttempt), 1);
    }

    #[test]
    fn refused_by_handler_closes_with_its_error() {
        let mut h = harness(config());
        h.handler.refuse_requests(ChannelError::LoggedOut);
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::LoggedOut]);
        assert!(h.transport.sent().is_empty());
    }

    #[test]
    fn handshake_post_carries_session_params_and_queued_maps() {
        let mut config = config();
        config.client_version = Some("22".into());
        let mut h = harness(config);
        h.handler.set_additional_params(vec![("app".into(), "demo".into())]);
        let mut base = WebChannelBase::new(&h.cx.config);
        base.send_map(&mut h.cx, json!({"early": "yes"}), None).unwrap();
        base.connect(
            &mut h.cx,
            "/test",
            "/channel",
            vec![("x".into(), "1".into())],
            Some(("OLD".into(), 41)),
        )
        .unwrap();
        let (init, init_req) = last(&h);
        assert_eq!(uri::get_param(&init_req.url, "app").as_deref(), Some("demo"));
        respond(&mut base, &mut h, init, 200, &[r#"[null]"#], true);
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["11111", "2"], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        let (_, handshake) = last(&h);
        assert_eq!(base.state(), ChannelState::Opening);
        assert_eq!(handshake.method, Method::Post);
        let rid: u64 = uri::get_param(&handshake.url, "RID").unwrap().parse().unwrap();
        assert!(rid < INITIAL_RID_RANGE);
        assert_eq!(uri::get_param(&handshake.url, "VER").as_deref(), Some("8"));
        assert_eq!(uri::get_param(&handshake.url, "CVER").as_deref(), Some("22"));
        assert_eq!(uri::get_param(&handshake.url, "OSID").as_deref(), Some("OLD"));
        assert_eq!(uri::get_param(&handshake.url, "OAID").as_deref(), Some("41"));
        assert_eq!(uri::get_param(&handshake.url, "x").as_deref(), Some("1"));
        assert_eq!(uri::get_param(&handshake.url, "SID"), None);
        assert_eq!(
            handshake.body.as_deref(),
            Some("count=1&ofs=0&req0_early=yes")
        );
        assert_eq!(base.pending_map_count(), 1);
    }

    #[test]
    fn control_array_opens_the_channel() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);

        assert_eq!(base.session_id(), "SID1");
        assert_eq!(base.channel_version(), 8);
        assert_eq!(base.server_version(), Some(1));
        assert_eq!(base.last_array_id(), 0);
        assert!(!base.is_buffered());
        assert_eq!(h.handler.opened(), 1);

        let (back, back_req) = last(&h);
        assert_eq!(base.back_channel_request_id(), Some(back));
        assert_eq!(back_req.method, Method::Get);
        assert_eq!(uri::get_param(&back_req.url, "RID").as_deref(), Some("rpc"));
        assert_eq!(uri::get_param(&back_req.url, "SID").as_deref(), Some("SID1"));
        assert_eq!(uri::get_param(&back_req.url, "CI").as_deref(), Some("0"));
        assert_eq!(uri::get_param(&back_req.url, "AID").as_deref(), Some("0"));
        assert_eq!(uri::get_param(&back_req.url, "TYPE").as_deref(), Some("xmlhttp"));
    }

    #[test]
    fn only_control_array_leaves_opening() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(&h);
        respond(&mut base, &mut h, init, 200, &[r#"[null]"#], true);
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["11111", "2"], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (handshake, _) = last(&h);
        respond(&mut base, &mut h, handshake, 200, &[&frame(r#"[[0,["hello"]],[1,["noop"]]]"#)], false);
        assert_eq!(base.state(), ChannelState::Opening);
        assert!(h.handler.arrays().is_empty());

        data(&mut base, &mut h, handshake, &frame(r#"[[2,["stop"]]]"#));
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::Stop]);
        assert_eq!(h.handler.closed_count(), 1);
    }

    #[test]
    fn keepalive_stretches_back_channel_timeout() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(&h);
        respond(&mut base, &mut h, init, 200, &[r#"[null]"#], true);
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["111112"], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (handshake, _) = last(&h);
        respond(
            &mut base,
            &mut h,
            handshake,
            200,
            &[&frame(r#"[[0,["c","SID2","",8,3,20000]]]"#)],
            true,
        );
        assert_eq!(base.back_channel_timeout(), Some(Duration::from_secs(30)));
        assert!(base.is_buffered());
        fire(&mut base, &mut h, TimerKey::BackChannel);
        let (back, back_req) = last(&h);
        assert_eq!(uri::get_param(&back_req.url, "CI").as_deref(), Some("1"));
        assert_eq!(
            h.scheduler.delay_of(TimerKey::Watchdog(back)),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn server_close_disconnects_and_stop_errors() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        respond(&mut base, &mut h, back, 200, &[&frame(r#"[[1,["a"]],[2,["close"]],[3,["b"]]]"#)], false);
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.arrays(), vec![json!(["a"])]);
        assert!(h.handler.errors().is_empty());
        let beacons = h.transport.beacons();
        assert_eq!(beacons.len(), 1);
        let beacon = &beacons[0];
        assert_eq!(uri::get_param(beacon, "TYPE").as_deref(), Some("terminate"));
        assert_eq!(uri::get_param(beacon, "SID").as_deref(), Some("SID1"));

        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        respond(&mut base, &mut h, back, 200, &[&frame(r#"[[1,["stop"]]]"#)], false);
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::Stop]);
        assert!(h.transport.beacons().is_empty());
    }

    #[test]
    fn batched_handler_gets_arrays_between_controls() {
        let mut h = harness(config());
        h.handler.set_batched(true);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        respond(
            &mut base,
            &mut h,
            back,
            200,
            &[&frame(r#"[[1,["a"]],[2,["noop"]],[3,["b"]]]"#), &frame(r#"[[4,["c"]]]"#)],
            false,
        );
        assert_eq!(
            h.handler.batches(),
            vec![vec![json!(["a"]), json!(["b"])], vec![json!(["c"])]]
        );
        assert_eq!(base.last_array_id(), 4);
    }

    #[test]
    fn handler_failure_is_contained() {
        let mut h = harness(config());
        h.handler.fail_on(json!(["bad"]));
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        respond(&mut base, &mut h, back, 200, &[&frame(r#"[[1,["bad"]],[2,["good"]]]"#)], false);
        assert_eq!(h.handler.arrays(), vec![json!(["bad"]), json!(["good"])]);
        assert_eq!(h.stats.count(Stat::HandlerException), 1);
        assert_eq!(base.state(), ChannelState::Opened);
    }

    #[test]
    fn maps_flush_in_order_and_are_acknowledged() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);

        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        base.send_map(&mut h.cx, json!({"y": "two"}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, post_req) = last(&h);
        assert_eq!(post_req.body.as_deref(), Some("count=2&ofs=0&req0_x=1&req1_y=two"));
        assert_eq!(uri::get_param(&post_req.url, "SID").as_deref(), Some("SID1"));
        assert_eq!(uri::get_param(&post_req.url, "AID").as_deref(), Some("0"));

        // A map sent while the only slot is busy waits for the next flush.
        base.send_map(&mut h.cx, json!({"z": 3}), None).unwrap();
        assert!(!h.scheduler.is_armed(TimerKey::ForwardChannel));

        respond(&mut base, &mut h, post, 200, &[&frame("[1,0,0]")], true);
        assert_eq!(h.handler.successes().last(), Some(&vec![0, 1]));
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (_, next) = last(&h);
        assert_eq!(next.body.as_deref(), Some("count=1&ofs=2&req0_z=3"));
        assert_eq!(h.stats.timings(), 2);
    }

    #[test]
    fn max_maps_per_request_splits_batches() {
        let mut config = config();
        config.max_maps_per_request = 2;
        let mut h = harness(config);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        for i in 0..3 {
            base.send_map(&mut h.cx, json!({ "i": i }), None).unwrap();
        }
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, post_req) = last(&h);
        assert_eq!(post_req.body.as_deref(), Some("count=2&ofs=0&req0_i=0&req1_i=1"));
        assert_eq!(base.outgoing_map_count(), 1);
        respond(&mut base, &mut h, post, 200, &[&frame("[1,0,0]")], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (_, next) = last(&h);
        assert_eq!(next.body.as_deref(), Some("count=1&ofs=2&req0_i=2"));
    }

    #[test]
    fn forward_failures_retry_then_close() {
        let mut config = config();
        config.rng_seed = Some(5);
        let mut h = harness(config);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        let mut attempts = Vec::new();
        loop {
            let (id, req) = last(&h);
            attempts.push(req);
            fail(&mut base, &mut h, id);
            if base.state() == ChannelState::Closed {
                break;
            }
            fire(&mut base, &mut h, TimerKey::ForwardChannel);
        }
        assert_eq!(attempts.len(), 3);
        let rids: Vec<_> = attempts
            .iter()
            .map(|r| uri::get_param(&r.url, "RID").unwrap())
            .collect();
        assert!(rids.iter().all(|rid| *rid == rids[0]));
        assert!(attempts
            .iter()
            .all(|r| r.body.as_deref() == Some("count=1&ofs=0&req0_x=1")));
        let retries: Vec<_> = attempts
            .iter()
            .map(|r| uri::get_param(&r.url, "t").unwrap())
            .collect();
        assert_eq!(retries, vec!["1", "2", "3"]);

        assert_eq!(h.handler.errors(), vec![ChannelError::RequestFailed]);
        let (pending, undelivered) = h.handler.closed().unwrap();
        assert_eq!(pending, vec![0]);
        assert!(undelivered.is_empty());
        assert_eq!(h.transport.network_tests(), 1);
        assert_eq!(h.stats.count(Stat::ErrorNetwork), 1);
    }

    #[test]
    fn retry_delay_grows_with_the_attempt() {
        let mut config = config();
        config.retry_delay_seed = Duration::ZERO;
        config.base_retry_delay = Duration::from_millis(1_000);
        let mut h = harness(config);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        let (id, _) = last(&h);
        fail(&mut base, &mut h, id);
        assert_eq!(h.scheduler.delay_of(TimerKey::ForwardChannel), Some(Duration::ZERO));
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        h.handler.set_active(false);
        let (id, _) = last(&h);
        fail(&mut base, &mut h, id);
        assert_eq!(
            h.scheduler.delay_of(TimerKey::ForwardChannel),
            Some(Duration::from_millis(2_000))
        );
    }

    #[test]
    fn fail_fast_never_retries() {
        let mut config = config();
        config.fail_fast = true;
        let mut h = harness(config);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (id, _) = last(&h);
        fail(&mut base, &mut h, id);
        assert_eq!(base.state(), ChannelState::Closed);
    }

    #[test]
    fn concrete_status_is_fatal() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (id, _) = last(&h);
        respond(&mut base, &mut h, id, 400, &["Unknown SID"], true);
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::UnknownSessionId]);
        assert_eq!(h.stats.count(Stat::ErrorOther), 1);
        assert_eq!(h.transport.network_tests(), 0);
    }

    #[test]
    fn malformed_forward_ack_is_bad_response() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (id, _) = last(&h);
        respond(&mut base, &mut h, id, 200, &[&frame("[1,2]")], false);
        assert_eq!(h.handler.errors(), vec![ChannelError::BadResponse]);
        assert_eq!(base.state(), ChannelState::Closed);
    }

    #[test]
    fn handshake_retry_reuses_the_rid() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(&h);
        respond(&mut base, &mut h, init, 200, &[r#"[null]"#], true);
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["11111", "2"], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (first, first_req) = last(&h);
        fail(&mut base, &mut h, first);
        assert_eq!(base.state(), ChannelState::Opening);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (_, second_req) = last(&h);
        assert_eq!(
            uri::get_param(&first_req.url, "RID"),
            uri::get_param(&second_req.url, "RID")
        );
        assert_eq!(uri::get_param(&second_req.url, "SID"), None);
    }

    #[test]
    fn back_channel_is_renewed_and_retried() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        respond(&mut base, &mut h, back, 200, &[&frame(r#"[[1,["a"]]]"#)], true);
        fire(&mut base, &mut h, TimerKey::BackChannel);
        let (renewed, renewed_req) = last(&h);
        assert_ne!(renewed, back);
        assert_eq!(uri::get_param(&renewed_req.url, "AID").as_deref(), Some("1"));

        for _ in 0..BACK_CHANNEL_MAX_RETRIES {
            let (id, _) = last(&h);
            fail(&mut base, &mut h, id);
            assert_eq!(base.state(), ChannelState::Opened);
            fire(&mut base, &mut h, TimerKey::BackChannel);
        }
        let (id, _) = last(&h);
        fail(&mut base, &mut h, id);
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::RequestFailed]);
    }

    #[test]
    fn missing_back_channel_is_restarted_when_stale() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);

        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, _) = last(&h);
        respond(&mut base, &mut h, post, 200, &[&frame("[0,0,0]")], true);
        // Back channel is younger than one RTT: left alone.
        assert_eq!(base.back_channel_request_id(), Some(back));

        h.clock.advance(RTT_ESTIMATE * 2);
        base.send_map(&mut h.cx, json!({"y": 2}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, _) = last(&h);
        respond(&mut base, &mut h, post, 200, &[&frame("[0,0,0]")], true);
        assert_eq!(base.back_channel_request_id(), None);
        assert!(h.transport.aborted().contains(&back));
        assert_eq!(h.stats.count(Stat::BackchannelMissing), 1);
        assert!(h.scheduler.is_armed(TimerKey::BackChannel));
    }

    #[test]
    fn dead_back_channel_is_replaced() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);

        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, _) = last(&h);
        respond(&mut base, &mut h, post, 200, &[&frame("[1,3,100]")], true);
        assert_eq!(base.last_post_response_array_id(), 3);
        assert_eq!(
            h.scheduler.delay_of(TimerKey::DeadBackChannel),
            Some(RTT_ESTIMATE * 2)
        );

        fire(&mut base, &mut h, TimerKey::DeadBackChannel);
        assert!(h.transport.aborted().contains(&back));
        assert_eq!(h.stats.count(Stat::BackchannelDead), 1);
        fire(&mut base, &mut h, TimerKey::BackChannel);
        assert_ne!(base.back_channel_request_id(), Some(back));
    }

    #[test]
    fn back_channel_data_clears_dead_timer() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (post, _) = last(&h);
        respond(&mut base, &mut h, post, 200, &[&frame("[1,3,100]")], true);
        assert!(h.scheduler.is_armed(TimerKey::DeadBackChannel));
        respond(&mut base, &mut h, back, 200, &[frame(r#"[[1,["a"]]]"#)], false);
        assert!(!h.scheduler.is_armed(TimerKey::DeadBackChannel));
    }

    #[test]
    fn offline_forces_forward_requests_through_completion() {
        let mut config = config();
        config.fail_fast = true;
        let mut h = harness(config);
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        base.on_browser_offline(&mut h.cx);
        assert_eq!(base.state(), ChannelState::Closed);
        assert_eq!(h.handler.errors(), vec![ChannelError::Network]);
        let (pending, _) = h.handler.closed().unwrap();
        assert_eq!(pending, vec![0]);
    }

    #[test]
    fn disconnect_cancels_everything_once() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);
        let (back, _) = last(&h);
        base.send_map(&mut h.cx, json!({"x": 1}), None).unwrap();
        base.disconnect(&mut h.cx);
        base.disconnect(&mut h.cx);
        assert_eq!(base.state(), ChannelState::Closed);
        assert!(h.transport.aborted().contains(&back));
        assert!(!h.scheduler.is_armed(TimerKey::ForwardChannel));
        assert_eq!(h.handler.closed_count(), 1);
        let (pending, undelivered) = h.handler.closed().unwrap();
        assert!(pending.is_empty());
        assert_eq!(undelivered, vec![0]);
        assert!(matches!(
            base.send_map(&mut h.cx, json!({"late": true}), None),
            Err(WebChannelError::Closed)
        ));

        // Stale events for cancelled requests change nothing.
        respond(&mut base, &mut h, back, 200, &[&frame(r#"[[5,["late"]]]"#)], true);
        assert!(h.handler.arrays().is_empty());
    }

    #[test]
    fn pooled_forward_requests_after_h2_handshake() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(&h);
        base.handle_transport_event(
            &mut h.cx,
            init,
            TransportEvent::Head {
                status: 200,
                headers: vec![(CLIENT_PROTOCOL_HEADER.into(), "h2".into())],
            },
        );
        base.handle_transport_event(&mut h.cx, init, TransportEvent::Data(Bytes::from_static(b"[null]")));
        base.handle_transport_event(&mut h.cx, init, TransportEvent::Complete(Completion::Finished));
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["11111", "2"], true);
        assert_eq!(base.forward_channel_pool().max_size(), 10);
    }

    #[test]
    fn pooled_retries_resend_maps_in_id_order() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        base.connect(&mut h.cx, "/test", "/channel", vec![], None).unwrap();
        let (init, _) = last(&h);
        base.handle_transport_event(
            &mut h.cx,
            init,
            TransportEvent::Head {
                status: 200,
                headers: vec![(CLIENT_PROTOCOL_HEADER.into(), "h2".into())],
            },
        );
        data(&mut base, &mut h, init, "[null]");
        base.handle_transport_event(&mut h.cx, init, TransportEvent::Complete(Completion::Finished));
        let (probe, _) = last(&h);
        respond(&mut base, &mut h, probe, 200, &["11111", "2"], true);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (handshake, _) = last(&h);
        respond(&mut base, &mut h, handshake, 200, &[&frame(r#"[[0,["c","SID1",null,8,1]]]"#)], true);
        fire(&mut base, &mut h, TimerKey::BackChannel);

        base.send_map(&mut h.cx, json!({"i": 0}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (first, _) = last(&h);
        base.send_map(&mut h.cx, json!({"i": 1}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);
        let (second, second_req) = last(&h);
        assert_eq!(second_req.body.as_deref(), Some("count=1&ofs=1&req0_i=1"));
        assert_eq!(base.forward_channel_pool().request_count(), 2);

        // The later request fails first and owns the retry.
        fail(&mut base, &mut h, second);
        fail(&mut base, &mut h, first);
        assert_eq!(base.outgoing_map_count(), 1);
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        let (_, retry) = last(&h);
        assert_eq!(retry.body.as_deref(), Some("count=2&ofs=0&req0_i=0&req1_i=1"));
        assert_eq!(
            uri::get_param(&retry.url, "RID"),
            uri::get_param(&second_req.url, "RID")
        );
    }

    #[test]
    fn non_object_map_is_reported_and_the_batch_still_goes_out() {
        let mut h = harness(config());
        let mut base = WebChannelBase::new(&h.cx.config);
        open(&mut base, &mut h);

        base.send_map(&mut h.cx, json!({"a": 1}), None).unwrap();
        base.send_map(&mut h.cx, json!([1]), None).unwrap();
        base.send_map(&mut h.cx, json!({"c": "z"}), None).unwrap();
        fire(&mut base, &mut h, TimerKey::ForwardChannel);

        let (post, request) = last(&h);
        assert_eq!(
            request.body.as_deref(),
            Some("count=3&ofs=0&req0_a=1&req1_type=_badmap&req2_c=z")
        );
        assert_eq!(h.handler.bad_maps(), vec![1]);
        assert_eq!(base.pending_map_count(), 3);

        respond(&mut base, &mut h, post, 200, &[frame("[1,0,0]")], true);
        assert_eq!(base.pending_map_count(), 0);
        assert_eq!(base.state(), ChannelState::Opened);
    }

    #[test]
    fn overflow_warning_matches_only_the_first_extra_map() {
        assert!(!overflows_request(0, 2));
        assert!(!overflows_request(1, 2));
        assert!(overflows_request(2, 2));
        assert!(!overflows_request(3, 2));
    }
}
