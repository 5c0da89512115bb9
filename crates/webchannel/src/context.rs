use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::codec::WireCodec;
use crate::config::ChannelConfig;
use crate::connection_state::ConnectionState;
use crate::handler::Handler;
use crate::stats::StatsSink;
use crate::transport::{Clock, RequestId, Scheduler, Transport};

/// Everything the channel state machines share: injected collaborators,
/// configuration, and the few pieces of per-connection state both the test
/// channel and the orchestrator write to.
///
/// Kept apart from the state machines so a request can be driven with
/// `&mut ChannelContext` while its owner is also borrowed mutably.
pub struct ChannelContext {
    pub config: ChannelConfig,
    pub transport: Box<dyn Transport>,
    pub scheduler: Box<dyn Scheduler>,
    pub clock: Box<dyn Clock>,
    pub stats: Box<dyn StatsSink>,
    pub handler: Box<dyn Handler>,
    pub codec: Box<dyn WireCodec>,
    pub connection_state: ConnectionState,
    pub rng: StdRng,
    /// Session id the server issued through the `X-HTTP-Session-Id` header.
    pub http_session_id: Option<String>,
    next_request_id: u64,
}

impl ChannelContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        transport: Box<dyn Transport>,
        scheduler: Box<dyn Scheduler>,
        clock: Box<dyn Clock>,
        stats: Box<dyn StatsSink>,
        handler: Box<dyn Handler>,
        codec: Box<dyn WireCodec>,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            transport,
            scheduler,
            clock,
            stats,
            handler,
            codec,
            connection_state: ConnectionState::default(),
            rng,
            http_session_id: None,
            next_request_id: 1,
        }
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId::new(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    /// Host prefix to use for `server_prefix`, after the embedder had its say.
    /// Always `None` when host prefixes are disabled.
    pub fn correct_host_prefix(&mut self, server_prefix: Option<&str>) -> Option<String> {
        if !self.config.allow_host_prefix {
            return None;
        }
        self.handler
            .correct_host_prefix(server_prefix)
            .filter(|prefix| !prefix.is_empty())
    }
}
