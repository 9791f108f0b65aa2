//! pg-relay tap entry point.
//!
//! Starts a relay from environment configuration, subscribes to the
//! topics in `RELAY_TOPICS` (comma separated), and logs every received
//! notification. Useful for watching a channel namespace live.

use tracing_subscriber::EnvFilter;

use pg_relay::channel::Topic;
use pg_relay::config::RelayConfig;
use pg_relay::notifier::Notifier;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env()?;

    let topics = std::env::var("RELAY_TOPICS")
        .unwrap_or_else(|_| "events".to_string())
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Topic::new)
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(
        name = %config.name,
        prefix = %config.channel_prefix,
        topics = topics.len(),
        "starting pg-relay tap"
    );

    let notifier = Notifier::start(config);
    let mut subscription = notifier.listen(topics).await?;

    while let Some(envelope) = subscription.recv().await {
        tracing::info!(
            source = %envelope.source,
            topic = %envelope.topic,
            payload = %envelope.payload,
            "notification"
        );
    }

    Ok(())
}
