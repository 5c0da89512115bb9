//! Observability events emitted by the channel.
//!
//! The sink is injected per channel; the core emits into it unconditionally
//! and never inspects what it does with the events.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stat {
    ConnectAttempt,
    ErrorNetwork,
    ErrorOther,
    TestStageOneStart,
    TestStageOneFailed,
    TestStageTwoStart,
    TestStageTwoFailed,
    TestStageTwoDataOne,
    TestStageTwoDataTwo,
    TestStageTwoDataBoth,
    Proxy,
    NoProxy,
    RequestUnknownSessionId,
    RequestBadStatus,
    RequestIncompleteData,
    RequestBadData,
    RequestNoData,
    RequestTimeout,
    BackchannelMissing,
    BackchannelDead,
    BrowserOffline,
    HandlerException,
    NetworkUp,
    NetworkDown,
}

impl Stat {
    pub fn as_str(self) -> &'static str {
        match self {
            Stat::ConnectAttempt => "connect_attempt",
            Stat::ErrorNetwork => "error_network",
            Stat::ErrorOther => "error_other",
            Stat::TestStageOneStart => "test_stage_one_start",
            Stat::TestStageOneFailed => "test_stage_one_failed",
            Stat::TestStageTwoStart => "test_stage_two_start",
            Stat::TestStageTwoFailed => "test_stage_two_failed",
            Stat::TestStageTwoDataOne => "test_stage_two_data_one",
            Stat::TestStageTwoDataTwo => "test_stage_two_data_two",
            Stat::TestStageTwoDataBoth => "test_stage_two_data_both",
            Stat::Proxy => "proxy",
            Stat::NoProxy => "noproxy",
            Stat::RequestUnknownSessionId => "request_unknown_session_id",
            Stat::RequestBadStatus => "request_bad_status",
            Stat::RequestIncompleteData => "request_incomplete_data",
            Stat::RequestBadData => "request_bad_data",
            Stat::RequestNoData => "request_no_data",
            Stat::RequestTimeout => "request_timeout",
            Stat::BackchannelMissing => "backchannel_missing",
            Stat::BackchannelDead => "backchannel_dead",
            Stat::BrowserOffline => "browser_offline",
            Stat::HandlerException => "handler_exception",
            Stat::NetworkUp => "network_up",
            Stat::NetworkDown => "network_down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerReachability {
    RequestMade,
    RequestSucceeded,
    RequestFailed,
    BackChannelActivity,
}

impl ServerReachability {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerReachability::RequestMade => "request_made",
            ServerReachability::RequestSucceeded => "request_succeeded",
            ServerReachability::RequestFailed => "request_failed",
            ServerReachability::BackChannelActivity => "back_channel_activity",
        }
    }
}

pub trait StatsSink: Send {
    fn stat(&self, stat: Stat);

    fn reachability(&self, event: ServerReachability);

    /// One forward-channel round trip: body size, latency and the retry count
    /// it took.
    fn timing(&self, size: usize, rtt: Duration, retries: u32);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn stat(&self, _stat: Stat) {}

    fn reachability(&self, _event: ServerReachability) {}

    fn timing(&self, _size: usize, _rtt: Duration, _retries: u32) {}
}
