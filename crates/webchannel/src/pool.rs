use tracing::debug;

use crate::context::ChannelContext;
use crate::error::RequestError;
use crate::request::ChannelRequest;
use crate::transport::RequestId;

/// Client protocol markers that allow several forward requests in flight.
const MULTIPLEXED_PROTOCOLS: [&str; 3] = ["h2", "spdy", "quic"];

#[derive(Debug)]
enum Slots {
    Single(Option<ChannelRequest>),
    Pooled(Vec<ChannelRequest>),
}

/// The in-flight forward-channel requests.
///
/// Starts as a single slot and widens once, to `max_pool_size`, when the
/// negotiated client protocol is multiplexed.
#[derive(Debug)]
pub struct ForwardChannelRequestPool {
    slots: Slots,
    max_size: usize,
    max_pool_size: usize,
}

impl ForwardChannelRequestPool {
    pub fn new(max_pool_size: usize) -> Self {
        Self {
            slots: Slots::Single(None),
            max_size: 1,
            max_pool_size: max_pool_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_pool_enabled(&self) -> bool {
        matches!(self.slots, Slots::Pooled(_))
    }

    pub fn is_full(&self) -> bool {
        self.request_count() >= self.max_size
    }

    pub fn request_count(&self) -> usize {
        match &self.slots {
            Slots::Single(slot) => usize::from(slot.is_some()),
            Slots::Pooled(requests) => requests.len(),
        }
    }

    pub fn has_pending_request(&self) -> bool {
        self.request_count() > 0
    }

    pub fn has_request(&self, id: RequestId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: RequestId) -> Option<&ChannelRequest> {
        match &self.slots {
            Slots::Single(slot) => slot.as_ref().filter(|r| r.id() == id),
            Slots::Pooled(requests) => requests.iter().find(|r| r.id() == id),
        }
    }

    pub fn get_mut(&mut self, id: RequestId) -> Option<&mut ChannelRequest> {
        match &mut self.slots {
            Slots::Single(slot) => slot.as_mut().filter(|r| r.id() == id),
            Slots::Pooled(requests) => requests.iter_mut().find(|r| r.id() == id),
        }
    }

    /// Adds a request, handing it back when the pool is already full.
    pub fn add_request(&mut self, request: ChannelRequest) -> Result<(), ChannelRequest> {
        if self.is_full() {
            return Err(request);
        }
        match &mut self.slots {
            Slots::Single(slot) => *slot = Some(request),
            Slots::Pooled(requests) => requests.push(request),
        }
        Ok(())
    }

    pub fn remove_request(&mut self, id: RequestId) -> Option<ChannelRequest> {
        match &mut self.slots {
            Slots::Single(slot) => {
                if slot.as_ref().is_some_and(|r| r.id() == id) {
                    slot.take()
                } else {
                    None
                }
            }
            Slots::Pooled(requests) => {
                let index = requests.iter().position(|r| r.id() == id)?;
                Some(requests.remove(index))
            }
        }
    }

    pub fn ids(&self) -> Vec<RequestId> {
        match &self.slots {
            Slots::Single(slot) => slot.iter().map(ChannelRequest::id).collect(),
            Slots::Pooled(requests) => requests.iter().map(ChannelRequest::id).collect(),
        }
    }

    /// Map ids carried by every in-flight request, in send order.
    pub fn pending_map_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = match &self.slots {
            Slots::Single(slot) => slot
                .iter()
                .flat_map(|r| r.pending_map_ids().iter().copied())
                .collect(),
            Slots::Pooled(requests) => requests
                .iter()
                .flat_map(|r| r.pending_map_ids().iter().copied())
                .collect(),
        };
        ids.sort_unstable();
        ids
    }

    /// Widens the pool when `protocol` names a multiplexed transport. Only
    /// the first widening takes effect; a request already in the single slot
    /// moves into the pool.
    pub fn apply_client_protocol(&mut self, protocol: Option<&str>) {
        if self.is_pool_enabled() || self.max_pool_size <= 1 {
            return;
        }
        let Some(protocol) = protocol else {
            return;
        };
        if !MULTIPLEXED_PROTOCOLS
            .iter()
            .any(|marker| protocol.contains(marker))
        {
            return;
        }
        debug!(
            target = "webchannel.pool",
            protocol,
            max_size = self.max_pool_size,
            "enabling forward request pool"
        );
        let existing = match std::mem::replace(&mut self.slots, Slots::Pooled(Vec::new())) {
            Slots::Single(slot) => slot,
            Slots::Pooled(_) => None,
        };
        self.max_size = self.max_pool_size;
        if let (Slots::Pooled(requests), Some(request)) = (&mut self.slots, existing) {
            requests.push(request);
        }
    }

    /// Cancels and drops every in-flight request.
    pub fn cancel(&mut self, cx: &mut ChannelContext) {
        let requests: Vec<ChannelRequest> = match &mut self.slots {
            Slots::Single(slot) => slot.take().into_iter().collect(),
            Slots::Pooled(requests) => std::mem::take(requests),
        };
        for mut request in requests {
            request.cancel(cx);
        }
    }

    /// Cancels every in-flight request with `error` but keeps them pooled, so
    /// the owner can run its normal completion path for each returned id.
    pub fn force_complete(&mut self, cx: &mut ChannelContext, error: RequestError) -> Vec<RequestId> {
        let ids = self.ids();
        for id in &ids {
            if let Some(request) = self.get_mut(*id) {
                request.cancel_with_error(cx, error);
            }
        }
        ids
    }
}
