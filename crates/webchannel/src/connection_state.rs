use serde_json::Value;

/// Negotiation results remembered across reconnects of one physical
/// connection, so the test channel can skip stages it already ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    /// Decoded stage-one response; element 0 is the suggested host prefix.
    pub handshake_result: Option<Vec<Value>>,
    /// Stage-two verdict: true when a buffering proxy was detected.
    pub buffering_proxy_result: Option<bool>,
}
