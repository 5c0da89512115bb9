//! Wire format for the forward and back channels.
//!
//! Outgoing maps are flattened into a form-encoded body addressed by a map
//! offset; incoming bodies are JSON arrays, or the looser array literals
//! older servers emit.

mod lenient;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use tracing::debug;

use crate::error::CodecError;
use crate::handler::QueuedMap;

pub const LATEST_CHANNEL_VERSION: u32 = 8;

/// Characters `encodeURIComponent` leaves untouched, in addition to ASCII
/// alphanumerics.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const BAD_MAP_SENTINEL: &str = "_badmap";

/// When a map id falls below the running offset, the queue is re-encoded with
/// the offset moved this far below it.
const OFFSET_BACKOFF: u64 = 100;

/// Encoding of outgoing maps and decoding of server arrays.
pub trait WireCodec: Send {
    /// Encodes the first `count` maps of `maps` into one request body. Maps
    /// whose payload cannot be enumerated are replaced by a sentinel and
    /// reported to `bad_map`; the rest of the batch is still encoded.
    fn encode_message_queue(
        &self,
        maps: &[QueuedMap],
        count: usize,
        bad_map: &mut dyn FnMut(&QueuedMap),
    ) -> String;

    fn decode_message(&self, text: &str) -> Result<Vec<Value>, CodecError>;
}

/// Channel version 8 codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct WireV8;

impl WireV8 {
    /// Appends `prefix + key = value` fields for one message to `out`.
    ///
    /// A payload that is not an object contributes a `type=_badmap` field and
    /// returns [`CodecError::NotAMap`].
    pub fn encode_message(
        &self,
        message: &Value,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), CodecError> {
        let Value::Object(fields) = message else {
            out.push(format!("{prefix}type={}", encode_component(BAD_MAP_SENTINEL)));
            return Err(CodecError::NotAMap);
        };
        for (key, value) in fields {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => "null".to_string(),
                Value::Array(_) | Value::Object(_) => value.to_string(),
            };
            out.push(format!(
                "{prefix}{}={}",
                encode_component(key),
                encode_component(&text)
            ));
        }
        Ok(())
    }
}

impl WireCodec for WireV8 {
    fn encode_message_queue(
        &self,
        maps: &[QueuedMap],
        count: usize,
        bad_map: &mut dyn FnMut(&QueuedMap),
    ) -> String {
        let maps = &maps[..count.min(maps.len())];
        let mut offset = maps.first().map(|m| m.map_id).unwrap_or(0);
        loop {
            let mut fields = vec![format!("count={}", maps.len())];
            if !maps.is_empty() {
                fields.push(format!("ofs={offset}"));
            }
            let mut restart = None;
            let mut bad = Vec::new();
            for (index, map) in maps.iter().enumerate() {
                if map.map_id < offset {
                    restart = Some(map.map_id.saturating_sub(OFFSET_BACKOFF));
                    break;
                }
                let prefix = format!("req{}_", map.map_id - offset);
                if self.encode_message(&map.payload, &prefix, &mut fields).is_err() {
                    bad.push(index);
                }
            }
            match restart {
                Some(lower) => {
                    debug!(
                        target = "webchannel.codec",
                        offset,
                        lower,
                        "map id below offset; re-encoding"
                    );
                    offset = lower;
                }
                None => {
                    for index in bad {
                        bad_map(&maps[index]);
                    }
                    return fields.join("&");
                }
            }
        }
    }

    fn decode_message(&self, text: &str) -> Result<Vec<Value>, CodecError> {
        let value = match serde_json::from_str::<Value>(text) {
            Ok(value) => value,
            Err(_) => lenient::parse(text)?,
        };
        match value {
            Value::Array(items) => Ok(items),
            _ => Err(CodecError::NotAnArray),
        }
    }
}

pub(crate) fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, URI_COMPONENT).to_string()
}
