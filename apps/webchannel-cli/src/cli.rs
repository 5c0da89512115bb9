use clap::Parser;
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "webchannel",
    about = "Open a webchannel session, send JSON maps read from stdin and print received arrays",
    author,
    version
)]
pub struct Cli {
    /// Server origin the test and channel paths are resolved against.
    #[arg(long, env = "WEBCHANNEL_BASE_URL")]
    pub base_url: Url,

    #[arg(long, env = "WEBCHANNEL_TEST_PATH", default_value = "/channel/test")]
    pub test_path: String,

    #[arg(long, env = "WEBCHANNEL_CHANNEL_PATH", default_value = "/channel/bind")]
    pub channel_path: String,

    /// Extra `key=value` parameter for the handshake. Repeatable.
    #[arg(long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Resume a previous session: its SID.
    #[arg(long, requires = "resume_aid")]
    pub resume_sid: Option<String>,

    /// Last array id received in the resumed session.
    #[arg(long, requires = "resume_sid")]
    pub resume_aid: Option<i64>,

    /// Print collected Prometheus metrics to stderr on exit.
    #[arg(long)]
    pub metrics: bool,

    #[arg(long, env = "WEBCHANNEL_LOG", default_value = "info")]
    pub log_filter: String,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}
