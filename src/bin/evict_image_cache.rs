use canvas_sync::{config::SyncConfig, services::persistent_cache::PersistentCache, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::from_env();
    telemetry::init_tracing()?;

    let cache = PersistentCache::open(&config).await?;
    if cache.pool().is_none() {
        println!(
            "Evict image cache: large tier unavailable at {}, nothing to do",
            config.cache_url
        );
        return Ok(());
    }

    let removed = cache.evict_images(config.image_retention_days).await?;
    println!(
        "Evict image cache: retention_days={} removed={}",
        config.image_retention_days, removed
    );

    Ok(())
}
