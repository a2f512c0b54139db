use certifica::config::Config;
use certifica::db;
use certifica::drive::DriveClient;
use certifica::pipeline;
use certifica::render::CertificateRenderer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "certifica=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(pool.as_ref()).await?;

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("verify") => {
            let code = args.next().ok_or("usage: certifica verify <code>")?;
            return verify_code(pool.as_ref(), &code).await;
        }
        Some("--once") => {
            run_guarded_batch(&config, &pool).await;
            return Ok(());
        }
        Some(other) => return Err(format!("unknown argument: {other}").into()),
        None => {}
    }

    info!(interval_secs = config.run_interval_secs, "certificate scheduler started");
    let mut ticker = tokio::time::interval(Duration::from_secs(config.run_interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        run_guarded_batch(&config, &pool).await;
    }
}

/// One scheduled run: advisory lock, stale-row sweep, the batch itself. An
/// overlapping run skips the tick instead of double-processing.
async fn run_guarded_batch(config: &Arc<Config>, pool: &db::DbPool) {
    let lock = match db::try_run_lock(pool.as_ref()).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            warn!("previous batch still running, skipping this tick");
            return;
        }
        Err(err) => {
            error!(%err, "could not acquire run lock");
            return;
        }
    };

    if let Err(err) = run_batch_once(config, pool).await {
        error!(%err, "batch aborted");
    }

    if let Err(err) = lock.release().await {
        warn!(%err, "run lock release failed");
    }
}

async fn run_batch_once(
    config: &Arc<Config>,
    pool: &db::DbPool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let swept =
        db::reset_stale_processing(pool.as_ref(), Duration::from_secs(config.run_interval_secs * 2))
            .await?;
    if swept > 0 {
        warn!(count = swept, "reset stale processing entries");
    }

    let renderer = CertificateRenderer::new(config)?;
    let publisher = DriveClient::new(config)?;
    let source = db::PgCandidateSource::new(pool.clone());
    let ledger = db::PgLedger::new(pool.clone(), config.signature.info.name.clone());

    pipeline::run_batch(config, &source, &ledger, &renderer, &publisher).await?;
    Ok(())
}

/// Lookup for the code printed on a certificate face.
async fn verify_code(
    pool: &sqlx::PgPool,
    code: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match db::find_by_code(pool, code).await? {
        Some(record) => {
            println!(
                "{} - {} ({:?})",
                record.full_name, record.course_name, record.status
            );
            if let Some(date) = record.issued_date {
                println!("issued: {date}");
            }
            if let Some(link) = record.drive_link {
                println!("{link}");
            }
        }
        None => println!("no certificate found for code {code}"),
    }
    Ok(())
}
