use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use url::Url;

use crate::error::ChannelError;

/// Opaque value attached to a map by the embedder and handed back with it.
pub type MapContext = Arc<dyn Any + Send + Sync>;

/// Error an embedder callback may return while handling server data.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// One outgoing key/value message.
#[derive(Clone)]
pub struct QueuedMap {
    pub map_id: u64,
    pub payload: Value,
    pub context: Option<MapContext>,
}

impl QueuedMap {
    pub fn new(map_id: u64, payload: Value, context: Option<MapContext>) -> Self {
        Self {
            map_id,
            payload,
            context,
        }
    }
}

impl fmt::Debug for QueuedMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedMap")
            .field("map_id", &self.map_id)
            .field("payload", &self.payload)
            .field("context", &self.context.as_ref().map(|_| "<opaque>"))
            .finish()
    }
}

impl PartialEq for QueuedMap {
    fn eq(&self, other: &Self) -> bool {
        self.map_id == other.map_id && self.payload == other.payload
    }
}

/// Embedder callbacks.
///
/// Every method has a no-op default so implementors only override what they
/// observe. Callbacks run on the thread driving the channel and must not block.
pub trait Handler: Send {
    /// Gate consulted before connecting. Returning an error closes the channel
    /// with that error.
    fn ok_to_make_request(&mut self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn channel_opened(&mut self) {}

    fn channel_handle_array(&mut self, _array: Value) -> Result<(), HandlerError> {
        Ok(())
    }

    /// When true, consecutive data arrays of one response are delivered
    /// together through [`Handler::channel_handle_multiple_arrays`].
    fn supports_batched_arrays(&self) -> bool {
        false
    }

    fn channel_handle_multiple_arrays(&mut self, arrays: Vec<Value>) -> Result<(), HandlerError> {
        for array in arrays {
            self.channel_handle_array(array)?;
        }
        Ok(())
    }

    /// Maps acknowledged by a successful forward request.
    fn channel_success(&mut self, _delivered: Vec<QueuedMap>) {}

    fn channel_error(&mut self, _error: ChannelError) {}

    /// Final callback. `pending` were sent without a known outcome,
    /// `undelivered` were never sent.
    fn channel_closed(&mut self, _pending: Vec<QueuedMap>, _undelivered: Vec<QueuedMap>) {}

    /// Extra query parameters for every channel request.
    fn additional_params(&mut self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Lets the embedder veto or rewrite the host prefix the server suggested.
    fn correct_host_prefix(&mut self, server_prefix: Option<&str>) -> Option<String> {
        server_prefix.map(str::to_string)
    }

    /// Inactive channels back off twice as long between retries.
    fn is_active(&self) -> bool {
        true
    }

    fn network_test_image_uri(&self) -> Option<Url> {
        None
    }

    fn bad_map_error(&mut self, _map: &QueuedMap) {}
}

/// Handler that ignores every callback.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl Handler for NoopHandler {}
