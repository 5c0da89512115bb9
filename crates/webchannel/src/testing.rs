//! In-memory collaborators for driving the channel deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

use crate::codec::WireV8;
use crate::config::ChannelConfig;
use crate::context::ChannelContext;
use crate::error::ChannelError;
use crate::handler::{Handler, HandlerError, QueuedMap};
use crate::stats::{ServerReachability, Stat, StatsSink};
use crate::transport::{Clock, HttpRequest, RequestId, Scheduler, TimerKey, Transport};
use crate::webchannel::WebChannel;

/// Wraps `text` in the chunked back-channel framing.
pub fn frame(text: &str) -> String {
    format!("{}\n{}", text.len(), text)
}

#[derive(Clone)]
pub struct ManualClock(Arc<Mutex<Instant>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }

    fn advance_to(&self, to: Instant) {
        let mut now = self.0.lock();
        if to > *now {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.0.lock()
    }
}

/// Records armed timers with their due instants; tests fire them by hand.
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    armed: Arc<Mutex<HashMap<TimerKey, Instant>>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            armed: Arc::default(),
        }
    }

    pub fn is_armed(&self, key: TimerKey) -> bool {
        self.armed.lock().contains_key(&key)
    }

    pub fn delay_of(&self, key: TimerKey) -> Option<Duration> {
        let due = *self.armed.lock().get(&key)?;
        Some(due.saturating_duration_since(self.clock.now()))
    }

    /// Disarms `key` and moves the clock to its due time. False when it was
    /// not armed.
    pub fn fire(&self, key: TimerKey) -> bool {
        let Some(due) = self.armed.lock().remove(&key) else {
            return false;
        };
        self.clock.advance_to(due);
        true
    }

    /// Fires the earliest armed timer among those due within `horizon`.
    pub fn fire_next_within(&self, horizon: Duration) -> Option<TimerKey> {
        let limit = self.clock.now() + horizon;
        let key = {
            let armed = self.armed.lock();
            armed
                .iter()
                .filter(|(_, due)| **due <= limit)
                .min_by_key(|(_, due)| **due)
                .map(|(key, _)| *key)?
        };
        self.fire(key).then_some(key)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, key: TimerKey, after: Duration) {
        let due = self.clock.now() + after;
        self.armed.lock().insert(key, due);
    }

    fn cancel(&mut self, key: TimerKey) {
        self.armed.lock().remove(&key);
    }
}

#[derive(Default)]
struct TransportLog {
    sent: Vec<(RequestId, HttpRequest)>,
    aborted: Vec<RequestId>,
    beacons: Vec<Url>,
    network_tests: usize,
    silent: bool,
    polled: HashMap<RequestId, Vec<u8>>,
}

#[derive(Clone, Default)]
pub struct FakeTransport(Arc<Mutex<TransportLog>>);

impl FakeTransport {
    pub fn sent(&self) -> Vec<(RequestId, HttpRequest)> {
        self.0.lock().sent.clone()
    }

    pub fn last_sent(&self) -> Option<(RequestId, HttpRequest)> {
        self.0.lock().sent.last().cloned()
    }

    pub fn aborted(&self) -> Vec<RequestId> {
        self.0.lock().aborted.clone()
    }

    pub fn beacons(&self) -> Vec<Url> {
        self.0.lock().beacons.clone()
    }

    pub fn network_tests(&self) -> usize {
        self.0.lock().network_tests
    }

    pub fn set_incremental(&self, incremental: bool) {
        self.0.lock().silent = !incremental;
    }

    pub fn push_poll_data(&self, id: RequestId, text: &str) {
        self.0
            .lock()
            .polled
            .entry(id)
            .or_default()
            .extend_from_slice(text.as_bytes());
    }
}

impl Transport for FakeTransport {
    fn send(&mut self, id: RequestId, request: HttpRequest) {
        self.0.lock().sent.push((id, request));
    }

    fn abort(&mut self, id: RequestId) {
        self.0.lock().aborted.push(id);
    }

    fn send_beacon(&mut self, url: Url) {
        self.0.lock().beacons.push(url);
    }

    fn test_network(&mut self, _url: Option<Url>) {
        self.0.lock().network_tests += 1;
    }

    fn notifies_incremental_data(&self) -> bool {
        !self.0.lock().silent
    }

    fn poll_data(&mut self, id: RequestId) -> Option<Bytes> {
        let bytes = self.0.lock().polled.remove(&id)?;
        (!bytes.is_empty()).then(|| Bytes::from(bytes))
    }
}

#[derive(Default)]
struct StatsLog {
    stats: HashMap<Stat, usize>,
    reachability: HashMap<ServerReachability, usize>,
    timings: usize,
}

#[derive(Clone, Default)]
pub struct RecordingStats(Arc<Mutex<StatsLog>>);

impl RecordingStats {
    pub fn count(&self, stat: Stat) -> usize {
        self.0.lock().stats.get(&stat).copied().unwrap_or(0)
    }

    pub fn reachability_count(&self, event: ServerReachability) -> usize {
        self.0.lock().reachability.get(&event).copied().unwrap_or(0)
    }

    pub fn timings(&self) -> usize {
        self.0.lock().timings
    }
}

impl StatsSink for RecordingStats {
    fn stat(&self, stat: Stat) {
        *self.0.lock().stats.entry(stat).or_default() += 1;
    }

    fn reachability(&self, event: ServerReachability) {
        *self.0.lock().reachability.entry(event).or_default() += 1;
    }

    fn timing(&self, _size: usize, _rtt: Duration, _retries: u32) {
        self.0.lock().timings += 1;
    }
}

struct HandlerLog {
    opened: usize,
    arrays: Vec<Value>,
    batches: Vec<Vec<Value>>,
    successes: Vec<Vec<u64>>,
    errors: Vec<ChannelError>,
    closed: Vec<(Vec<u64>, Vec<u64>)>,
    bad_maps: Vec<u64>,

    refuse: Option<ChannelError>,
    batched: bool,
    fail_on: Option<Value>,
    active: bool,
    additional_params: Vec<(String, String)>,
}

impl Default for HandlerLog {
    fn default() -> Self {
        Self {
            opened: 0,
            arrays: Vec::new(),
            batches: Vec::new(),
            successes: Vec::new(),
            errors: Vec::new(),
            closed: Vec::new(),
            bad_maps: Vec::new(),
            refuse: None,
            batched: false,
            fail_on: None,
            active: true,
            additional_params: Vec::new(),
        }
    }
}

fn map_ids(maps: &[QueuedMap]) -> Vec<u64> {
    maps.iter().map(|m| m.map_id).collect()
}

/// Handler that records every callback. Map lists are recorded as ids.
#[derive(Clone, Default)]
pub struct RecordingHandler(Arc<Mutex<HandlerLog>>);

impl RecordingHandler {
    pub fn opened(&self) -> usize {
        self.0.lock().opened
    }

    pub fn arrays(&self) -> Vec<Value> {
        self.0.lock().arrays.clone()
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.0.lock().batches.clone()
    }

    pub fn successes(&self) -> Vec<Vec<u64>> {
        self.0.lock().successes.clone()
    }

    pub fn errors(&self) -> Vec<ChannelError> {
        self.0.lock().errors.clone()
    }

    /// Pending and undelivered map ids of the most recent close.
    pub fn closed(&self) -> Option<(Vec<u64>, Vec<u64>)> {
        self.0.lock().closed.last().cloned()
    }

    pub fn closed_count(&self) -> usize {
        self.0.lock().closed.len()
    }

    pub fn bad_maps(&self) -> Vec<u64> {
        self.0.lock().bad_maps.clone()
    }

    pub fn refuse_requests(&self, error: ChannelError) {
        self.0.lock().refuse = Some(error);
    }

    pub fn set_batched(&self, batched: bool) {
        self.0.lock().batched = batched;
    }

    /// Makes the handler fail (after recording) whenever it sees `array`.
    pub fn fail_on(&self, array: Value) {
        self.0.lock().fail_on = Some(array);
    }

    pub fn set_active(&self, active: bool) {
        self.0.lock().active = active;
    }

    pub fn set_additional_params(&self, params: Vec<(String, String)>) {
        self.0.lock().additional_params = params;
    }
}

impl Handler for RecordingHandler {
    fn ok_to_make_request(&mut self) -> Result<(), ChannelError> {
        match self.0.lock().refuse {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn channel_opened(&mut self) {
        self.0.lock().opened += 1;
    }

    fn channel_handle_array(&mut self, array: Value) -> Result<(), HandlerError> {
        let mut log = self.0.lock();
        let fail = log.fail_on.as_ref() == Some(&array);
        log.arrays.push(array);
        if fail {
            return Err("handler rejected array".into());
        }
        Ok(())
    }

    fn supports_batched_arrays(&self) -> bool {
        self.0.lock().batched
    }

    fn channel_handle_multiple_arrays(&mut self, arrays: Vec<Value>) -> Result<(), HandlerError> {
        let mut log = self.0.lock();
        let fail = log.fail_on.as_ref().is_some_and(|bad| arrays.contains(bad));
        log.batches.push(arrays);
        if fail {
            return Err("handler rejected batch".into());
        }
        Ok(())
    }

    fn channel_success(&mut self, delivered: Vec<QueuedMap>) {
        self.0.lock().successes.push(map_ids(&delivered));
    }

    fn channel_error(&mut self, error: ChannelError) {
        self.0.lock().errors.push(error);
    }

    fn channel_closed(&mut self, pending: Vec<QueuedMap>, undelivered: Vec<QueuedMap>) {
        self.0
            .lock()
            .closed
            .push((map_ids(&pending), map_ids(&undelivered)));
    }

    fn additional_params(&mut self) -> Vec<(String, String)> {
        self.0.lock().additional_params.clone()
    }

    fn is_active(&self) -> bool {
        self.0.lock().active
    }

    fn bad_map_error(&mut self, map: &QueuedMap) {
        self.0.lock().bad_maps.push(map.map_id);
    }
}

/// Test-side views of the collaborators a context was built with.
#[derive(Clone)]
pub struct Handles {
    pub transport: FakeTransport,
    pub scheduler: ManualScheduler,
    pub clock: ManualClock,
    pub stats: RecordingStats,
    pub handler: RecordingHandler,
}

pub struct Harness {
    pub cx: ChannelContext,
    pub transport: FakeTransport,
    pub scheduler: ManualScheduler,
    pub clock: ManualClock,
    pub stats: RecordingStats,
    pub handler: RecordingHandler,
}

fn context(mut config: ChannelConfig) -> (ChannelContext, Handles) {
    if config.rng_seed.is_none() {
        config.rng_seed = Some(7);
    }
    let clock = ManualClock::new();
    let handles = Handles {
        transport: FakeTransport::default(),
        scheduler: ManualScheduler::new(clock.clone()),
        clock,
        stats: RecordingStats::default(),
        handler: RecordingHandler::default(),
    };
    let cx = ChannelContext::new(
        config,
        Box::new(handles.transport.clone()),
        Box::new(handles.scheduler.clone()),
        Box::new(handles.clock.clone()),
        Box::new(handles.stats.clone()),
        Box::new(handles.handler.clone()),
        Box::new(WireV8),
    );
    (cx, handles)
}

pub fn harness(config: ChannelConfig) -> Harness {
    let (cx, handles) = context(config);
    Harness {
        cx,
        transport: handles.transport,
        scheduler: handles.scheduler,
        clock: handles.clock,
        stats: handles.stats,
        handler: handles.handler,
    }
}

pub fn channel_harness(config: ChannelConfig) -> (WebChannel, Handles) {
    let (cx, handles) = context(config);
    (WebChannel::new(cx), handles)
}
