use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use argus_relay::{
    BootstrapPeer, Node, NodeConfig, StreamMetadata, StreamSource, SubscriberEvent,
    DEFAULT_NAMESPACE,
};

/// `ID=URL` pair for `--publish`.
#[derive(Clone, Debug)]
struct PublishArg {
    stream_id: String,
    url: String,
}

impl FromStr for PublishArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (stream_id, url) = s
            .split_once('=')
            .context("stream to publish must be ID=URL")?;
        if stream_id.is_empty() || url.is_empty() {
            anyhow::bail!("stream id and URL must both be non-empty");
        }
        Ok(PublishArg {
            stream_id: stream_id.to_string(),
            url: url.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "argus-relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Peer to join through, as IP:PORT/IDENTITY. Repeatable.
    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short, long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Relay a recording, as ID=URL. Repeatable.
    #[arg(short, long, value_name = "ID=URL")]
    publish: Vec<PublishArg>,

    /// Listen to a stream by id. Repeatable.
    #[arg(short, long, value_name = "ID")]
    subscribe: Vec<String>,

    /// Seconds between status lines.
    #[arg(long, default_value = "60")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig::default()
        .with_namespace(&args.namespace)
        .with_listen_addr(args.bind);
    for peer in &args.bootstrap {
        info!("Bootstrapping from {}/{}", peer.addr, peer.identity.short());
    }
    config.transport.bootstrap = args.bootstrap.clone();

    let node = Node::start(config).await?;
    info!("Node identity: {}", node.identity());
    info!("Listening on {}", node.local_addr());

    for arg in &args.publish {
        let metadata = StreamMetadata::named(arg.stream_id.clone());
        match node
            .publisher()
            .publish_stream(&arg.stream_id, StreamSource::http(arg.url.clone()), metadata)
            .await
        {
            Ok(published) => info!(topic = %published.topic, "Publishing {}", published.stream_id),
            Err(e) => warn!(stream_id = %arg.stream_id, error = %e, "Publish failed"),
        }
    }

    let mut events = node.subscriber().events().await;
    for stream_id in &args.subscribe {
        if let Err(e) = node.subscriber().subscribe_to_stream(stream_id).await {
            warn!(stream_id = %stream_id, error = %e, "Subscribe failed");
        }
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(event) = async {
                match events.as_mut() {
                    Some(rx) => rx.recv().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    SubscriberEvent::Metadata { stream_id, metadata, .. } => {
                        info!(stream_id = %stream_id, name = ?metadata.name, "stream metadata");
                    }
                    SubscriberEvent::End { stream_id, total_bytes, total_chunks, reason } => {
                        info!(stream_id = %stream_id, total_bytes, total_chunks, reason = ?reason, "stream ended");
                    }
                    _ => {}
                }
            }
            _ = interval.tick() => {
                let status = node.info().await;
                info!(
                    peers = status.connected_peers.len(),
                    local_streams = status.streams.local,
                    discovered_streams = status.streams.discovered,
                    publishing = status.active_streams.len(),
                    subscribed = status.subscriptions.len(),
                    "status"
                );
                for stream in node.directory().discovered_streams(Default::default()).await {
                    info!(
                        stream_id = %stream.stream_id,
                        publisher = %stream.publisher.short(),
                        name = ?stream.metadata.name,
                        "available"
                    );
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
