use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use fanout_common::channel::ChannelSender;
use fanout_common::config::AppConfig;
use fanout_common::db;
use fanout_common::types::platform;
use fanout_engine::pg::PgStore;
use fanout_engine::{FanoutOrchestrator, NotificationService};
use fanout_notifier::{ApnsConfig, ApnsSender, GcmConfig, GcmSender};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fanout_worker=info,fanout_engine=info,fanout_notifier=info".into()
            }),
        )
        .json()
        .init();

    let ids = parse_ids(std::env::args().skip(1))?;

    tracing::info!("Fan-out worker starting...");

    let config = AppConfig::from_env()?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::migrate(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let mut builder = FanoutOrchestrator::builder()
        .recipient_store(store.clone())
        .delivery_store(store.clone())
        .send_timeout(Duration::from_secs(config.channel_send_timeout_secs));
    for (device, sender) in channel_senders(&config)? {
        tracing::info!(platform = device, method = sender.method(), "Channel sender registered");
        builder = builder.sender(device, sender);
    }
    let orchestrator = builder.build()?;
    let service = NotificationService::new(store);

    if ids.is_empty() {
        tracing::warn!("No notification ids given, nothing to fan out");
        return Ok(());
    }

    let work = async {
        for id in &ids {
            let notification = match service.get(*id).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(notification_id = %id, error = %e, "Cannot load notification");
                    continue;
                }
            };

            let summary = orchestrator
                .save_trigger(&notification, Some(config.fanout_batch_size))
                .await;
            tracing::info!(
                notification_id = %id,
                batches = summary.batches,
                succeeded = summary.succeeded,
                failed = summary.failed,
                state = ?summary.state,
                "Notification fanned out"
            );
        }
    };

    // Run with graceful shutdown on Ctrl+C
    tokio::select! {
        _ = work => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
        }
    }

    tracing::info!("Fan-out worker stopped.");
    Ok(())
}

/// Senders for every platform whose credentials are configured.
fn channel_senders(config: &AppConfig) -> anyhow::Result<Vec<(&'static str, Arc<dyn ChannelSender>)>> {
    let mut senders: Vec<(&'static str, Arc<dyn ChannelSender>)> = Vec::new();

    match config.apns() {
        Some(settings) => {
            let apns: Arc<dyn ChannelSender> =
                Arc::new(ApnsSender::new(ApnsConfig::from_settings(&settings)?)?);
            senders.push((platform::IOS, apns));
        }
        None => tracing::warn!("APNs credentials incomplete, iOS delivery disabled"),
    }

    match &config.gcm_server_key {
        Some(key) => {
            let gcm: Arc<dyn ChannelSender> = Arc::new(GcmSender::new(
                GcmConfig::new(key.clone()).with_endpoint(config.gcm_endpoint.clone()),
            )?);
            senders.push((platform::ANDROID, gcm));
        }
        None => tracing::warn!("GCM_SERVER_KEY not set, Android delivery disabled"),
    }

    Ok(senders)
}

fn parse_ids(args: impl Iterator<Item = String>) -> anyhow::Result<Vec<Uuid>> {
    args.map(|arg| {
        Uuid::parse_str(&arg).map_err(|_| anyhow::anyhow!("Invalid notification id: {}", arg))
    })
    .collect()
}
