//! Contract between a [`ChannelRequest`] and whatever owns it.
//!
//! Both the test channel and the orchestrator own requests. Requests never
//! call back into their owner; they return [`RequestEvent`]s, which
//! [`dispatch_transport_event`] and [`dispatch_timer`] route to the owner once
//! the request borrow has ended.

use crate::context::ChannelContext;
use crate::request::{ChannelRequest, RequestEvent};
use crate::stats::ServerReachability;
use crate::transport::{RequestId, TimerKey, TransportEvent};

pub trait Channel {
    fn request_mut(&mut self, id: RequestId) -> Option<&mut ChannelRequest>;

    fn tracks_request(&self, id: RequestId) -> bool;

    fn is_closed(&self) -> bool;

    /// One decoded chunk (or, for non-chunked requests, the response so far).
    fn on_request_data(&mut self, cx: &mut ChannelContext, id: RequestId, data: &str);

    /// The request reached a terminal state. Called at most once per request.
    fn on_request_complete(&mut self, cx: &mut ChannelContext, id: RequestId);
}

/// Feeds one transport event to the owned request and delivers what it
/// produced. Events for requests the channel no longer tracks are dropped.
pub fn dispatch_transport_event<C>(
    channel: &mut C,
    cx: &mut ChannelContext,
    id: RequestId,
    event: TransportEvent,
) where
    C: Channel + ?Sized,
{
    let Some(request) = channel.request_mut(id) else {
        return;
    };
    let events = request.handle_event(cx, event);
    deliver(channel, cx, id, events);
}

pub fn dispatch_timer<C>(channel: &mut C, cx: &mut ChannelContext, key: TimerKey)
where
    C: Channel + ?Sized,
{
    let Some(id) = key.request() else {
        return;
    };
    let Some(request) = channel.request_mut(id) else {
        return;
    };
    let events = request.handle_timer(cx, key);
    deliver(channel, cx, id, events);
}

/// Delivers request events in order, stopping as soon as the owner closes or
/// lets go of the request (a handler may disconnect mid-response).
pub fn deliver<C>(channel: &mut C, cx: &mut ChannelContext, id: RequestId, events: Vec<RequestEvent>)
where
    C: Channel + ?Sized,
{
    for event in events {
        if channel.is_closed() || !channel.tracks_request(id) {
            return;
        }
        match event {
            RequestEvent::Data(text) => {
                cx.stats.reachability(ServerReachability::BackChannelActivity);
                channel.on_request_data(cx, id, &text);
            }
            RequestEvent::Complete => channel.on_request_complete(cx, id),
        }
    }
}
