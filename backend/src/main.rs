use std::time::{Duration, Instant};

use actix_web::web::Data;
use anyhow::Result;
use backend::{db::Db, settings::Settings, web, AppState};
use log::debug;

const PRUNE_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env()?;
    let db = Db::connect(&settings.database_url, settings.db_pool_size)?;
    let state = Data::new(AppState::new(db, settings));

    let pruner_state = state.clone();
    let pruner = actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = pruner_state.limiter.prune(Instant::now());
            if pruned > 0 {
                debug!("Pruned {pruned} idle rate limit buckets");
            }
        }
    });

    web::new_http_server(state).await?;
    pruner.abort();
    Ok(())
}
