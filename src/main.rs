use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use futures::future::join_all;
use tracing::{Level, error, info, warn};

use notify_relay::{
    AmqpTransport, LoggingListener, NotificationRelay, RelayConfig, SubscribeOutcome,
};

/// Command line arguments for the notification relay
#[derive(Parser, Debug)]
#[command(author, version, about = "Relays broker topic notifications from robot hosts")]
struct Args {
    /// Host to connect to, repeatable
    #[arg(long = "host", required = true)]
    hosts: Vec<String>,

    /// Topic filter to subscribe on every host, repeatable
    #[arg(long = "topic", required = true)]
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayConfig::try_from_env().context("invalid relay configuration")?;

    let level = Level::from_str(&config.log_level)
        .with_context(|| format!("invalid log level {:?}", config.log_level))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("Starting notification relay as {}", config.app_id);

    let transport = Arc::new(AmqpTransport::new(&config.app_id, config.amqp_settings()));
    let relay = NotificationRelay::new(transport, config.relay_settings());

    let listener = Arc::new(LoggingListener);
    for host in &args.hosts {
        for topic in &args.topics {
            relay.register_listener(host, topic, listener.clone()).await;
        }
    }
    let _dispatcher = relay.start();

    let requests = args
        .hosts
        .iter()
        .flat_map(|host| args.topics.iter().map(move |topic| (host, topic)));
    let outcomes = join_all(requests.map(|(host, topic)| {
        let relay = &relay;
        async move { (host, topic, relay.subscribe(host, topic).await) }
    }))
    .await;

    let mut active = 0;
    for (host, topic, outcome) in outcomes {
        match outcome {
            SubscribeOutcome::Subscribed | SubscribeOutcome::AlreadySubscribed => {
                active += 1;
                info!(host = %host, topic = %topic, "{:?}", outcome);
            }
            other => error!(host = %host, topic = %topic, "Subscription failed: {:?}", other),
        }
    }
    if active == 0 {
        relay.drain_all().await;
        bail!("no subscription could be established");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down, draining broker connections");

    let outcome = relay.drain_all().await;
    match outcome.error() {
        None => info!("Drain complete: {:?}", outcome),
        Some(code) => warn!("Drain incomplete ({}): {:?}", code, outcome),
    }

    Ok(())
}
