// Bootstrap utilities: wire the engine's collaborators from settings

use crate::clock::SystemClock;
use crate::config::Settings;
use crate::db::repositories::{DispatchRepository, SubscriptionRepository};
use crate::db::{DbPool, RedisPool};
use crate::lock::{DistributedLock, RedLock};
use crate::notify::{LogGateway, MessagingGateway, NotificationDispatcher, SmtpGateway};
use crate::scheduler::{AlertEngine, EngineConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Connect to PostgreSQL and apply the ledger migrations when enabled
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;
    db_pool
        .health_check()
        .await
        .context("Database health check failed")?;

    if settings.database.run_migrations {
        db_pool
            .run_migrations()
            .await
            .context("Failed to apply dispatch ledger migrations")?;
    }

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Connect to Redis for the sweep lease, if configured
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<Option<RedisPool>> {
    let Some(redis) = &settings.redis else {
        info!("No Redis configured, sweeps rely on the ledger alone");
        return Ok(None);
    };

    let redis_pool = RedisPool::new(redis)
        .await
        .context("Failed to initialize Redis pool")?;
    redis_pool
        .health_check()
        .await
        .context("Redis health check failed")?;

    info!("Redis pool initialized");
    Ok(Some(redis_pool))
}

/// SMTP gateway, or the log gateway when `smtp.dry_run` is set
pub fn init_gateway(settings: &Settings) -> Result<Arc<dyn MessagingGateway>> {
    if settings.smtp.dry_run {
        info!("SMTP dry run enabled, alerts will only be logged");
        return Ok(Arc::new(LogGateway));
    }

    let gateway = SmtpGateway::from_config(&settings.smtp).context("Failed to configure SMTP gateway")?;
    Ok(Arc::new(gateway))
}

/// Build a fully wired engine backed by PostgreSQL (and Redis, if configured)
#[tracing::instrument(skip(settings))]
pub async fn init_alert_engine(settings: &Settings) -> Result<AlertEngine> {
    let db_pool = init_database_pool(settings).await?;
    let redis_pool = init_redis_pool(settings).await?;
    let gateway = init_gateway(settings)?;

    let config = EngineConfig::from_settings(&settings.alerts, settings.redis.as_ref())
        .context("Invalid alerts configuration")?;

    let engine = AlertEngine::new(
        config,
        Arc::new(SubscriptionRepository::new(
            db_pool.clone(),
            settings.alerts.resolver_page_size,
        )),
        Arc::new(DispatchRepository::new(db_pool)),
        NotificationDispatcher::new(gateway),
        Arc::new(SystemClock),
    )
    .context("Failed to create alert engine")?;

    let engine = match redis_pool {
        Some(pool) => {
            let lock: Arc<dyn DistributedLock> = Arc::new(RedLock::new(pool));
            engine.with_lock(lock)
        }
        None => engine,
    };

    info!("Alert engine initialized");
    Ok(engine)
}
