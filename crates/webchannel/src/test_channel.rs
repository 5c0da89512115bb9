//! Handshake and buffering-proxy probe run before a session opens.
//!
//! Stage one fetches the handshake (`MODE=init`) and learns the host prefix
//! and client protocol. Stage two opens a non-chunked GET the server answers
//! with `11111`, a pause, then `2`. Seeing `11111` as its own data event
//! proves responses stream through unbuffered.

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::Channel;
use crate::context::ChannelContext;
use crate::error::{RequestError, WebChannelResult};
use crate::request::{ChannelRequest, RequestKind, Rid};
use crate::stats::Stat;
use crate::transport::RequestId;
use crate::uri;

pub const CLIENT_PROTOCOL_HEADER: &str = "X-Client-Wire-Protocol";
pub const HTTP_SESSION_ID_HEADER: &str = "X-HTTP-Session-Id";

/// First chunk the server writes on the buffering probe.
const INTERMEDIATE_RESULT: &str = "11111";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Init,
    ConnectionTesting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Finished { use_chunked: bool },
    Failed(RequestError),
}

#[derive(Debug)]
pub struct BaseTestChannel {
    state: TestState,
    request: Option<ChannelRequest>,
    path: String,
    params: Vec<(String, String)>,
    extra_headers: Vec<(String, String)>,
    host_prefix: Option<String>,
    client_protocol: Option<String>,
    handshake_text: Option<String>,
    received_intermediate: bool,
    last_status_code: Option<u16>,
    outcome: Option<TestOutcome>,
    aborted: bool,
}

impl Default for BaseTestChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseTestChannel {
    pub fn new() -> Self {
        Self {
            state: TestState::Init,
            request: None,
            path: String::new(),
            params: Vec::new(),
            extra_headers: Vec::new(),
            host_prefix: None,
            client_protocol: None,
            handshake_text: None,
            received_intermediate: false,
            last_status_code: None,
            outcome: None,
            aborted: false,
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn host_prefix(&self) -> Option<&str> {
        self.host_prefix.as_deref()
    }

    /// Protocol reported by the server through `X-Client-Wire-Protocol`.
    pub fn client_protocol(&self) -> Option<&str> {
        self.client_protocol.as_deref()
    }

    pub fn last_status_code(&self) -> Option<u16> {
        self.last_status_code
    }

    pub fn set_extra_headers(&mut self, headers: Vec<(String, String)>) {
        self.extra_headers = headers;
    }

    /// Result of the test, once. `None` while still running.
    pub fn take_outcome(&mut self) -> Option<TestOutcome> {
        self.outcome.take()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.aborted
    }

    /// Starts stage one. `params` are added to every test request (version
    /// and embedder parameters).
    pub fn connect(
        &mut self,
        cx: &mut ChannelContext,
        path: &str,
        params: Vec<(String, String)>,
    ) -> WebChannelResult<()> {
        self.path = path.to_string();
        self.params = params;
        let mut url = uri::data_uri(cx.config.base_url.as_ref(), &self.path, None)?;
        uri::set_params(&mut url, &self.params);

        cx.stats.stat(Stat::TestStageOneStart);

        if let Some(handshake) = cx.connection_state.handshake_result.clone() {
            let suggested = handshake.first().and_then(Value::as_str);
            self.host_prefix = cx.correct_host_prefix(suggested);
            debug!(target = "webchannel.test", host_prefix = ?self.host_prefix, "handshake cached; skipping stage one");
            self.state = TestState::ConnectionTesting;
            self.connect_stage_two(cx);
            return Ok(());
        }

        uri::set_param(&mut url, "MODE", "init");
        if let Some(param) = cx.config.http_session_id_param.clone() {
            uri::set_param(&mut url, HTTP_SESSION_ID_HEADER, &param);
        }
        debug!(target = "webchannel.test", url = %url, "starting stage one");
        let mut request = ChannelRequest::new(cx, RequestKind::TestInit, Rid::Num(0), 0);
        request.set_extra_headers(self.extra_headers.clone());
        request.xml_http_get(cx, url, false);
        self.request = Some(request);
        self.state = TestState::Init;
        Ok(())
    }

    /// Cancels the active probe. No outcome is reported afterwards.
    pub fn abort(&mut self, cx: &mut ChannelContext) {
        if let Some(mut request) = self.request.take() {
            request.cancel(cx);
        }
        self.aborted = true;
    }

    fn connect_stage_two(&mut self, cx: &mut ChannelContext) {
        cx.stats.stat(Stat::TestStageTwoStart);
        if let Some(buffered) = cx.connection_state.buffering_proxy_result {
            debug!(target = "webchannel.test", buffered, "buffering verdict cached");
            self.finish(cx, !buffered);
            return;
        }

        let host_prefix = if cx.config.supports_cross_domain {
            self.host_prefix.as_deref()
        } else {
            None
        };
        let mut url = match uri::data_uri(cx.config.base_url.as_ref(), &self.path, host_prefix) {
            Ok(url) => url,
            Err(err) => {
                warn!(target = "webchannel.test", error = %err, "cannot build probe url");
                cx.stats.stat(Stat::TestStageTwoFailed);
                self.outcome = Some(TestOutcome::Failed(RequestError::BadData));
                return;
            }
        };
        uri::set_params(&mut url, &self.params);
        uri::set_param(&mut url, "TYPE", "xmlhttp");
        if let (Some(param), Some(value)) = (
            cx.config.http_session_id_param.as_deref(),
            cx.http_session_id.as_deref(),
        ) {
            uri::set_param(&mut url, param, value);
        }

        debug!(target = "webchannel.test", url = %url, "starting stage two");
        let mut request = ChannelRequest::new(cx, RequestKind::TestProxyProbe, Rid::Num(0), 0);
        request.set_extra_headers(self.extra_headers.clone());
        request.xml_http_get(cx, url, false);
        self.request = Some(request);
    }

    fn finish(&mut self, cx: &mut ChannelContext, use_chunked: bool) {
        cx.stats
            .stat(if use_chunked { Stat::NoProxy } else { Stat::Proxy });
        debug!(target = "webchannel.test", use_chunked, "connection test finished");
        self.request = None;
        self.outcome = Some(TestOutcome::Finished { use_chunked });
    }

    fn apply_control_headers(&mut self, cx: &mut ChannelContext, request: &ChannelRequest) {
        if let Some(protocol) = request.response_header(CLIENT_PROTOCOL_HEADER) {
            self.client_protocol = Some(protocol.to_string());
        }
        if cx.config.http_session_id_param.is_some() {
            match request.response_header(HTTP_SESSION_ID_HEADER) {
                Some(session) => cx.http_session_id = Some(session.to_string()),
                None => warn!(
                    target = "webchannel.test",
                    header = HTTP_SESSION_ID_HEADER,
                    "session id header missing from handshake"
                ),
            }
        }
    }

    fn on_stage_one_complete(&mut self, cx: &mut ChannelContext, request: &ChannelRequest) {
        self.apply_control_headers(cx, request);
        let text = self.handshake_text.take().unwrap_or_default();
        let decoded = match cx.codec.decode_message(&text) {
            Ok(decoded) if !decoded.is_empty() => decoded,
            Ok(_) => {
                warn!(target = "webchannel.test", "empty handshake response");
                self.fail(cx, RequestError::BadData);
                return;
            }
            Err(err) => {
                warn!(target = "webchannel.test", error = %err, "undecodable handshake response");
                self.fail(cx, RequestError::BadData);
                return;
            }
        };
        let suggested = decoded.first().and_then(Value::as_str).map(str::to_string);
        cx.connection_state.handshake_result = Some(decoded);
        self.host_prefix = cx.correct_host_prefix(suggested.as_deref());
        self.state = TestState::ConnectionTesting;
        self.connect_stage_two(cx);
    }

    fn fail(&mut self, cx: &mut ChannelContext, error: RequestError) {
        cx.stats.stat(match self.state {
            TestState::Init => Stat::TestStageOneFailed,
            TestState::ConnectionTesting => Stat::TestStageTwoFailed,
        });
        debug!(target = "webchannel.test", state = ?self.state, error = %error, "connection test failed");
        self.request = None;
        self.outcome = Some(TestOutcome::Failed(error));
    }
}

impl Channel for BaseTestChannel {
    fn request_mut(&mut self, id: RequestId) -> Option<&mut ChannelRequest> {
        self.request.as_mut().filter(|r| r.id() == id)
    }

    fn tracks_request(&self, id: RequestId) -> bool {
        self.request.as_ref().is_some_and(|r| r.id() == id)
    }

    fn is_closed(&self) -> bool {
        self.is_finished()
    }

    fn on_request_data(&mut self, cx: &mut ChannelContext, _id: RequestId, data: &str) {
        match self.state {
            TestState::Init => self.handshake_text = Some(data.to_string()),
            TestState::ConnectionTesting => {
                if self.received_intermediate {
                    cx.stats.stat(Stat::TestStageTwoDataTwo);
                } else if data == INTERMEDIATE_RESULT {
                    cx.stats.stat(Stat::TestStageTwoDataOne);
                    self.received_intermediate = true;
                    if cx.config.early_non_buffered_detection {
                        if let Some(mut request) = self.request.take() {
                            self.last_status_code = request.status();
                            request.cancel(cx);
                        }
                        self.finish(cx, true);
                    }
                } else {
                    cx.stats.stat(Stat::TestStageTwoDataBoth);
                    self.received_intermediate = false;
                }
            }
        }
    }

    fn on_request_complete(&mut self, cx: &mut ChannelContext, id: RequestId) {
        if !self.tracks_request(id) {
            return;
        }
        let Some(request) = self.request.take() else {
            return;
        };
        self.last_status_code = request.status();
        if !request.success() {
            self.fail(cx, request.last_error().unwrap_or(RequestError::Status));
            return;
        }
        match self.state {
            TestState::Init => self.on_stage_one_complete(cx, &request),
            TestState::ConnectionTesting => {
                let use_chunked = self.received_intermediate;
                self.finish(cx, use_chunked);
            }
        }
    }
}
