mod cli;
mod telemetry;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use webchannel::runtime::{self, ChannelEvent};
use webchannel::{ChannelConfig, ConnectOptions, PrometheusStats};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let mut config = ChannelConfig::from_env();
    config.base_url = Some(cli.base_url.clone());

    let mut options = ConnectOptions::new(cli.test_path.clone(), cli.channel_path.clone());
    for (key, value) in &cli.params {
        options = options.with_param(key.clone(), value.clone());
    }
    if let (Some(sid), Some(aid)) = (cli.resume_sid.clone(), cli.resume_aid) {
        options = options.resume(sid, aid);
    }

    let stats = PrometheusStats::new();
    let (handle, mut events, task) = runtime::spawn_with_events(config, Box::new(stats.clone()), None);
    handle.connect(options).await.context("connect rejected")?;
    info!(base = %cli.base_url, "connecting");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let outcome = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };
                match event {
                    ChannelEvent::Opened => {
                        let snapshot = handle.snapshot().await?;
                        info!(
                            sid = %snapshot.session_id,
                            version = snapshot.channel_version,
                            buffered = snapshot.buffered,
                            host_prefix = ?snapshot.host_prefix,
                            "channel open"
                        );
                    }
                    ChannelEvent::Array(array) => println!("{array}"),
                    ChannelEvent::Delivered(maps) => {
                        info!(count = maps.len(), "maps delivered");
                    }
                    ChannelEvent::Error(error) => {
                        break Err(anyhow::anyhow!(error).context("channel failed"));
                    }
                    ChannelEvent::Closed { pending, undelivered } => {
                        if !pending.is_empty() || !undelivered.is_empty() {
                            warn!(pending = pending.len(), undelivered = undelivered.len(), "closed with maps in flight");
                        }
                        break Ok(());
                    }
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line.context("reading stdin")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<Value>(&line) {
                        Ok(map @ Value::Object(_)) => handle.send_map(map).await?,
                        Ok(_) => warn!("ignoring input line: maps must be JSON objects"),
                        Err(err) => warn!(error = %err, "ignoring input line: invalid JSON"),
                    },
                    None => {
                        stdin_open = false;
                        info!("stdin closed; disconnecting");
                        handle.disconnect().await?;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; disconnecting");
                handle.disconnect().await?;
            }
        }
    };

    drop(handle);
    if let Err(err) = task.await {
        bail!("channel actor panicked: {err}");
    }
    if cli.metrics {
        eprintln!("{}", String::from_utf8_lossy(&stats.gather()));
    }
    outcome
}
