//! A single HTTP exchange of the channel.
//!
//! A `ChannelRequest` issues its request through the context's transport,
//! guards it with a watchdog, decodes the response (chunk framed or as
//! cumulative text) and reports progress as [`RequestEvent`]s. It never calls
//! its owner directly.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use url::Url;

use crate::context::ChannelContext;
use crate::error::RequestError;
use crate::stats::{ServerReachability, Stat};
use crate::transport::{Completion, HttpRequest, Method, RequestId, TimerKey, TransportEvent};
use crate::uri;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
const UNKNOWN_SESSION_ID_MARKER: &str = "Unknown SID";
/// The server answers every channel request with 200. Any other status,
/// other 2xx codes included, means an intermediary answered and the body
/// is not channel data.
const SUCCESS_STATUS: u16 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    TestInit,
    TestProxyProbe,
    Forward,
    Back,
    Close,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::TestInit => "test_init",
            RequestKind::TestProxyProbe => "test_proxy_probe",
            RequestKind::Forward => "forward",
            RequestKind::Back => "back",
            RequestKind::Close => "close",
        }
    }
}

/// Wire request id: numeric for forward requests, `rpc` on the back channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rid {
    Num(u64),
    Rpc,
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rid::Num(n) => write!(f, "{n}"),
            Rid::Rpc => f.write_str("rpc"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Data(String),
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(String),
    /// Not enough bytes for the next chunk yet.
    Incomplete,
    /// The size prefix is not a decimal number.
    Invalid,
}

/// Incremental decoder for `"<decimal size>\n<size bytes>"` framing over a
/// growing buffer. Only the cursor is kept, so the caller owns the bytes.
#[derive(Debug, Clone, Default)]
pub struct ChunkDecoder {
    cursor: usize,
}

impl ChunkDecoder {
    pub fn next_chunk(&mut self, buffer: &[u8]) -> Chunk {
        let rest = &buffer[self.cursor.min(buffer.len())..];
        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            return Chunk::Incomplete;
        };
        let size = std::str::from_utf8(&rest[..newline])
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok());
        let Some(size) = size else {
            return Chunk::Invalid;
        };
        let start = newline + 1;
        if rest.len() - start < size {
            return Chunk::Incomplete;
        }
        let data = String::from_utf8_lossy(&rest[start..start + size]).into_owned();
        self.cursor += start + size;
        Chunk::Data(data)
    }

    pub fn consumed(&self) -> usize {
        self.cursor
    }
}

pub struct ChannelRequest {
    id: RequestId,
    kind: RequestKind,
    rid: Rid,
    retry_attempt: u32,
    decode_chunks: bool,
    timeout: Duration,
    extra_headers: Vec<(String, String)>,
    post_data: Option<String>,
    pending_map_ids: Vec<u64>,

    start_time: Option<Instant>,
    deadline: Option<Instant>,
    last_processed: Option<Instant>,

    status: Option<u16>,
    headers: Vec<(String, String)>,
    buffer: Vec<u8>,
    decoder: ChunkDecoder,
    emitted_len: usize,

    success: bool,
    last_error: Option<RequestError>,

    completed: bool,
    cancelled: bool,
    exchange_open: bool,
    watchdog_armed: bool,
    polling: bool,
    throttle_pending: bool,
}

impl fmt::Debug for ChannelRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rid", &self.rid)
            .field("retry_attempt", &self.retry_attempt)
            .field("status", &self.status)
            .field("success", &self.success)
            .field("last_error", &self.last_error)
            .field("completed", &self.completed)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl ChannelRequest {
    pub fn new(cx: &mut ChannelContext, kind: RequestKind, rid: Rid, retry_attempt: u32) -> Self {
        Self {
            id: cx.next_request_id(),
            kind,
            rid,
            retry_attempt,
            decode_chunks: false,
            timeout: cx.config.request_timeout,
            extra_headers: Vec::new(),
            post_data: None,
            pending_map_ids: Vec::new(),
            start_time: None,
            deadline: None,
            last_processed: None,
            status: None,
            headers: Vec::new(),
            buffer: Vec::new(),
            decoder: ChunkDecoder::default(),
            emitted_len: 0,
            success: false,
            last_error: None,
            completed: false,
            cancelled: false,
            exchange_open: false,
            watchdog_armed: false,
            polling: false,
            throttle_pending: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn rid(&self) -> Rid {
        self.rid
    }

    pub fn retry_attempt(&self) -> u32 {
        self.retry_attempt
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn last_error(&self) -> Option<RequestError> {
        self.last_error
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn start_time(&self) -> Option<Instant> {
        self.start_time
    }

    pub fn post_data(&self) -> Option<&str> {
        self.post_data.as_deref()
    }

    pub fn pending_map_ids(&self) -> &[u64] {
        &self.pending_map_ids
    }

    pub fn set_pending_map_ids(&mut self, ids: Vec<u64>) {
        self.pending_map_ids = ids;
    }

    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn set_extra_headers(&mut self, headers: Vec<(String, String)>) {
        self.extra_headers = headers;
    }

    /// Case-insensitive response header lookup.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Records that the owner's handler failed on this request's data. The
    /// request itself still counts as successful.
    pub fn note_handler_exception(&mut self) {
        self.last_error = Some(RequestError::HandlerException);
    }

    pub fn xml_http_post(
        &mut self,
        cx: &mut ChannelContext,
        url: Url,
        body: String,
        decode_chunks: bool,
    ) {
        self.decode_chunks = decode_chunks;
        self.post_data = Some(body.clone());
        self.send(cx, Method::Post, url, Some(body));
    }

    pub fn xml_http_get(&mut self, cx: &mut ChannelContext, url: Url, decode_chunks: bool) {
        self.decode_chunks = decode_chunks;
        self.send(cx, Method::Get, url, None);
    }

    /// Fire-and-forget terminate signal. Completes immediately without events.
    pub fn send_close_request(&mut self, cx: &mut ChannelContext, mut url: Url) {
        uri::make_unique(&mut url, &mut cx.rng);
        debug!(target = "webchannel.request", id = %self.id, url = %url, "sending close beacon");
        cx.transport.send_beacon(url);
        self.start_time = Some(cx.clock.now());
        self.success = true;
        self.completed = true;
    }

    fn send(&mut self, cx: &mut ChannelContext, method: Method, mut url: Url, body: Option<String>) {
        uri::set_param(&mut url, "t", &self.retry_attempt.to_string());
        uri::make_unique(&mut url, &mut cx.rng);

        let mut headers = cx.config.extra_headers.clone();
        headers.extend(self.extra_headers.iter().cloned());
        if method == Method::Post {
            headers.push(("Content-Type".to_string(), FORM_CONTENT_TYPE.to_string()));
        }

        let now = cx.clock.now();
        self.start_time = Some(now);
        self.deadline = Some(now + self.timeout);

        debug!(
            target = "webchannel.request",
            id = %self.id,
            kind = self.kind.as_str(),
            rid = %self.rid,
            method = method.as_str(),
            url = %url,
            "sending request"
        );
        cx.stats.reachability(ServerReachability::RequestMade);
        cx.transport.send(
            self.id,
            HttpRequest {
                method,
                url,
                headers,
                body,
            },
        );
        self.exchange_open = true;

        cx.scheduler.schedule(TimerKey::Watchdog(self.id), self.timeout);
        self.watchdog_armed = true;

        if !cx.transport.notifies_incremental_data() {
            self.polling = true;
            cx.scheduler
                .schedule(TimerKey::Poll(self.id), cx.config.poll_interval);
        }
    }

    pub fn handle_event(&mut self, cx: &mut ChannelContext, event: TransportEvent) -> Vec<RequestEvent> {
        let mut out = Vec::new();
        if self.completed || self.cancelled {
            return out;
        }
        match event {
            TransportEvent::Head { status, headers } => {
                trace!(target = "webchannel.request", id = %self.id, status, "response head");
                self.status = Some(status);
                self.headers = headers;
            }
            TransportEvent::Data(bytes) => {
                self.append(cx, &bytes);
                if self.status == Some(SUCCESS_STATUS) {
                    self.on_partial(cx, &mut out);
                }
            }
            TransportEvent::Complete(completion) => self.on_complete(cx, completion, &mut out),
        }
        out
    }

    pub fn handle_timer(&mut self, cx: &mut ChannelContext, key: TimerKey) -> Vec<RequestEvent> {
        let mut out = Vec::new();
        match key {
            TimerKey::Watchdog(_) => {
                self.watchdog_armed = false;
                if !self.completed && !self.cancelled {
                    self.on_watchdog(cx, &mut out);
                }
            }
            TimerKey::Poll(_) => {
                if self.completed || self.cancelled || !self.polling {
                    return out;
                }
                if let Some(bytes) = cx.transport.poll_data(self.id) {
                    if !bytes.is_empty() {
                        self.append(cx, &bytes);
                        if self.status == Some(SUCCESS_STATUS) {
                            self.on_partial(cx, &mut out);
                        }
                    }
                }
                if !self.completed && !self.cancelled {
                    cx.scheduler
                        .schedule(TimerKey::Poll(self.id), cx.config.poll_interval);
                }
            }
            TimerKey::Throttle(_) => {
                self.throttle_pending = false;
                if self.completed || self.cancelled {
                    return out;
                }
                self.last_processed = Some(cx.clock.now());
                self.decode_available(cx, false, &mut out);
            }
            _ => {}
        }
        out
    }

    /// Stops the exchange without reporting completion. Idempotent.
    pub fn cancel(&mut self, cx: &mut ChannelContext) {
        if self.completed || self.cancelled {
            return;
        }
        debug!(target = "webchannel.request", id = %self.id, kind = self.kind.as_str(), "cancelled");
        self.cancelled = true;
        self.cleanup(cx);
    }

    /// Cancels and records `error` so the owner can run its normal failure
    /// path for this request.
    pub fn cancel_with_error(&mut self, cx: &mut ChannelContext, error: RequestError) {
        self.cancel(cx);
        self.success = false;
        self.last_error = Some(error);
    }

    fn append(&mut self, cx: &mut ChannelContext, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        // Activity pushes the deadline out; the armed watchdog re-arms itself
        // for the remainder when it fires early.
        self.deadline = Some(cx.clock.now() + self.timeout);
    }

    fn on_partial(&mut self, cx: &mut ChannelContext, out: &mut Vec<RequestEvent>) {
        if let Some(interval) = cx.config.readiness_throttle {
            let now = cx.clock.now();
            if let Some(last) = self.last_processed {
                let due = last + interval;
                if now < due {
                    if !self.throttle_pending {
                        cx.scheduler.schedule(TimerKey::Throttle(self.id), due - now);
                        self.throttle_pending = true;
                    }
                    return;
                }
            }
            self.last_processed = Some(now);
        }
        self.decode_available(cx, false, out);
    }

    /// Emits whatever is decodable from the buffer. On a fatal framing error
    /// the request fails and completion is emitted.
    fn decode_available(&mut self, cx: &mut ChannelContext, response_complete: bool, out: &mut Vec<RequestEvent>) {
        if !self.decode_chunks {
            if self.buffer.len() > self.emitted_len {
                self.emitted_len = self.buffer.len();
                out.push(RequestEvent::Data(
                    String::from_utf8_lossy(&self.buffer).into_owned(),
                ));
            }
            return;
        }
        loop {
            match self.decoder.next_chunk(&self.buffer) {
                Chunk::Data(text) => out.push(RequestEvent::Data(text)),
                Chunk::Incomplete => {
                    if response_complete && self.decoder.consumed() < self.buffer.len() {
                        warn!(
                            target = "webchannel.request",
                            id = %self.id,
                            buffered = self.buffer.len() - self.decoder.consumed(),
                            "response ended inside a chunk"
                        );
                        cx.stats.stat(Stat::RequestIncompleteData);
                        self.fail(cx, RequestError::BadData, out);
                    }
                    return;
                }
                Chunk::Invalid => {
                    warn!(target = "webchannel.request", id = %self.id, "invalid chunk size prefix");
                    cx.stats.stat(Stat::RequestBadData);
                    self.fail(cx, RequestError::BadData, out);
                    return;
                }
            }
        }
    }

    fn on_complete(&mut self, cx: &mut ChannelContext, completion: Completion, out: &mut Vec<RequestEvent>) {
        self.exchange_open = false;
        match completion {
            Completion::Finished => {
                if self.polling {
                    if let Some(bytes) = cx.transport.poll_data(self.id) {
                        self.buffer.extend_from_slice(&bytes);
                    }
                }
                let status = self.status;
                let unknown_sid = status == Some(400)
                    && String::from_utf8_lossy(&self.buffer).contains(UNKNOWN_SESSION_ID_MARKER);
                match status {
                    Some(SUCCESS_STATUS) => {}
                    Some(400) if unknown_sid => {
                        cx.stats.stat(Stat::RequestUnknownSessionId);
                        self.fail(cx, RequestError::UnknownSessionId, out);
                        return;
                    }
                    status => {
                        debug!(
                            target = "webchannel.request",
                            id = %self.id,
                            error = %RequestError::Status.describe(status),
                            "request failed"
                        );
                        cx.stats.stat(Stat::RequestBadStatus);
                        self.fail(cx, RequestError::Status, out);
                        return;
                    }
                }
                if self.buffer.is_empty() {
                    cx.stats.stat(Stat::RequestNoData);
                    self.fail(cx, RequestError::NoData, out);
                    return;
                }
                self.decode_available(cx, true, out);
                if self.completed {
                    return;
                }
                self.success = true;
                self.completed = true;
                cx.stats.reachability(ServerReachability::RequestSucceeded);
                self.cleanup(cx);
                out.push(RequestEvent::Complete);
            }
            Completion::Failed(reason) => {
                debug!(target = "webchannel.request", id = %self.id, reason = %reason, "transport failure");
                self.status = None;
                self.fail(cx, RequestError::Status, out);
            }
            Completion::TimedOut => {
                debug!(target = "webchannel.request", id = %self.id, "transport deadline expired");
                self.status = None;
                self.fail(cx, RequestError::Status, out);
            }
            Completion::Offline => {
                cx.stats.stat(Stat::BrowserOffline);
                self.fail(cx, RequestError::BrowserOffline, out);
            }
        }
    }

    fn on_watchdog(&mut self, cx: &mut ChannelContext, out: &mut Vec<RequestEvent>) {
        let now = cx.clock.now();
        if let Some(deadline) = self.deadline {
            if now < deadline {
                cx.scheduler.schedule(TimerKey::Watchdog(self.id), deadline - now);
                self.watchdog_armed = true;
                return;
            }
        }
        debug!(target = "webchannel.request", id = %self.id, kind = self.kind.as_str(), "watchdog timeout");
        if self.kind != RequestKind::Close {
            cx.stats.stat(Stat::RequestTimeout);
        }
        self.fail(cx, RequestError::Timeout, out);
    }

    fn fail(&mut self, cx: &mut ChannelContext, error: RequestError, out: &mut Vec<RequestEvent>) {
        if self.completed {
            return;
        }
        if error != RequestError::Timeout || self.kind != RequestKind::Close {
            cx.stats.reachability(ServerReachability::RequestFailed);
        }
        self.success = false;
        self.last_error = Some(error);
        self.completed = true;
        self.cleanup(cx);
        out.push(RequestEvent::Complete);
    }

    fn cleanup(&mut self, cx: &mut ChannelContext) {
        if self.watchdog_armed {
            cx.scheduler.cancel(TimerKey::Watchdog(self.id));
            self.watchdog_armed = false;
        }
        if self.polling {
            cx.scheduler.cancel(TimerKey::Poll(self.id));
            self.polling = false;
        }
        if self.throttle_pending {
            cx.scheduler.cancel(TimerKey::Throttle(self.id));
            self.throttle_pending = false;
        }
        if self.exchange_open {
            cx.transport.abort(self.id);
            self.exchange_open = false;
        }
    }
}
