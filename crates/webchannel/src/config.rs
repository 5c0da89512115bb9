use std::time::Duration;

use url::Url;

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 45_000;
pub const DEFAULT_FORWARD_CHANNEL_REQUEST_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_FORWARD_CHANNEL_MAX_RETRIES: u32 = 2;
pub const DEFAULT_BASE_RETRY_DELAY_MS: u64 = 5_000;
pub const DEFAULT_RETRY_DELAY_SEED_MS: u64 = 10_000;
pub const DEFAULT_MAX_MAPS_PER_REQUEST: usize = 1_000;
pub const DEFAULT_MAX_POOL_SIZE: usize = 10;

/// Tunables for one channel instance.
///
/// `Default` gives the protocol defaults; [`ChannelConfig::from_env`] layers
/// `WEBCHANNEL_*` environment variables on top of them.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base that relative test and channel paths are resolved against.
    pub base_url: Option<Url>,
    pub request_timeout: Duration,
    pub forward_channel_request_timeout: Duration,
    /// Fixed back-channel timeout; the server keepalive overrides it once
    /// negotiated.
    pub back_channel_request_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Minimum interval between partial-data processing passes.
    pub readiness_throttle: Option<Duration>,
    pub forward_channel_max_retries: u32,
    /// Fail fast: the forward channel is never retried.
    pub fail_fast: bool,
    pub base_retry_delay: Duration,
    pub retry_delay_seed: Duration,
    pub max_maps_per_request: usize,
    pub max_pool_size: usize,
    pub allow_host_prefix: bool,
    pub allow_chunked_mode: bool,
    pub supports_cross_domain: bool,
    pub channel_version: u32,
    pub client_version: Option<String>,
    /// Query parameter name the server should use for the HTTP session id.
    pub http_session_id_param: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    /// Headers sent on the handshake POST only.
    pub init_headers: Vec<(String, String)>,
    pub early_non_buffered_detection: bool,
    pub network_test_url: Option<Url>,
    /// Seeds the retry jitter and cache busters, for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            forward_channel_request_timeout: Duration::from_millis(
                DEFAULT_FORWARD_CHANNEL_REQUEST_TIMEOUT_MS,
            ),
            back_channel_request_timeout: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            readiness_throttle: None,
            forward_channel_max_retries: DEFAULT_FORWARD_CHANNEL_MAX_RETRIES,
            fail_fast: false,
            base_retry_delay: Duration::from_millis(DEFAULT_BASE_RETRY_DELAY_MS),
            retry_delay_seed: Duration::from_millis(DEFAULT_RETRY_DELAY_SEED_MS),
            max_maps_per_request: DEFAULT_MAX_MAPS_PER_REQUEST,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            allow_host_prefix: true,
            allow_chunked_mode: true,
            supports_cross_domain: false,
            channel_version: crate::codec::LATEST_CHANNEL_VERSION,
            client_version: None,
            http_session_id_param: None,
            extra_headers: Vec::new(),
            init_headers: Vec::new(),
            early_non_buffered_detection: false,
            network_test_url: None,
            rng_seed: None,
        }
    }
}

impl ChannelConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source. Unset or unparsable
    /// values keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parsed(key).map(Duration::from_millis).unwrap_or(default)
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
                .unwrap_or(default)
        };
        let url = |key: &str| lookup(key).and_then(|v| Url::parse(&v).ok());

        Self {
            base_url: url("WEBCHANNEL_BASE_URL"),
            request_timeout: millis("WEBCHANNEL_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            forward_channel_request_timeout: millis(
                "WEBCHANNEL_FORWARD_TIMEOUT_MS",
                defaults.forward_channel_request_timeout,
            ),
            back_channel_request_timeout: parsed("WEBCHANNEL_BACK_TIMEOUT_MS")
                .map(Duration::from_millis),
            poll_interval: millis("WEBCHANNEL_POLL_INTERVAL_MS", defaults.poll_interval),
            readiness_throttle: parsed("WEBCHANNEL_READINESS_THROTTLE_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            forward_channel_max_retries: lookup("WEBCHANNEL_FORWARD_MAX_RETRIES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.forward_channel_max_retries),
            fail_fast: flag("WEBCHANNEL_FAIL_FAST", defaults.fail_fast),
            base_retry_delay: millis("WEBCHANNEL_BASE_RETRY_DELAY_MS", defaults.base_retry_delay),
            retry_delay_seed: millis("WEBCHANNEL_RETRY_DELAY_SEED_MS", defaults.retry_delay_seed),
            max_maps_per_request: lookup("WEBCHANNEL_MAX_MAPS_PER_REQUEST")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_maps_per_request),
            max_pool_size: lookup("WEBCHANNEL_MAX_POOL_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_pool_size),
            allow_host_prefix: flag("WEBCHANNEL_ALLOW_HOST_PREFIX", defaults.allow_host_prefix),
            allow_chunked_mode: flag("WEBCHANNEL_ALLOW_CHUNKED_MODE", defaults.allow_chunked_mode),
            supports_cross_domain: flag(
                "WEBCHANNEL_SUPPORTS_CROSS_DOMAIN",
                defaults.supports_cross_domain,
            ),
            channel_version: lookup("WEBCHANNEL_CHANNEL_VERSION")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.channel_version),
            client_version: lookup("WEBCHANNEL_CLIENT_VERSION").filter(|v| !v.is_empty()),
            http_session_id_param: lookup("WEBCHANNEL_HTTP_SESSION_ID_PARAM")
                .filter(|v| !v.is_empty()),
            extra_headers: lookup("WEBCHANNEL_EXTRA_HEADERS")
                .map(|v| parse_headers(&v))
                .unwrap_or_default(),
            init_headers: lookup("WEBCHANNEL_INIT_HEADERS")
                .map(|v| parse_headers(&v))
                .unwrap_or_default(),
            early_non_buffered_detection: flag(
                "WEBCHANNEL_EARLY_NON_BUFFERED_DETECTION",
                defaults.early_non_buffered_detection,
            ),
            network_test_url: url("WEBCHANNEL_NETWORK_TEST_URL"),
            rng_seed: parsed("WEBCHANNEL_RNG_SEED"),
        }
    }

    /// Forward retries allowed after the first attempt.
    pub fn effective_forward_max_retries(&self) -> u32 {
        if self.fail_fast {
            0
        } else {
            self.forward_channel_max_retries
        }
    }
}

/// Parses `Name: value` pairs separated by `;` or newlines.
pub fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(|c| c == ';' || c == '\n')
        .filter_map(|entry| {
            let (name, value) = entry.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
