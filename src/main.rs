mod api;
mod app_state;
mod auth;
mod balancing;
mod config;
mod domain;
mod errors;
mod executor;
mod logging;
mod optimizer;
mod provider;
mod scheduler;
mod shield;
mod simulation;
mod store;
mod weather_emergency;

use anyhow::Result;
use axum::Router;
use tracing::{info, warn};

use app_state::AppState;
use config::Config;
use logging::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = Config::load()?;
    init_tracing(&cfg.logging);

    let state = AppState::new(cfg.clone()).await?;

    let mut app: Router = api::router(state.clone(), &cfg);

    #[cfg(feature = "swagger")]
    {
        app = api::with_swagger(app);
    }

    #[cfg(feature = "metrics")]
    {
        app = api::with_metrics(app);
    }

    let core_tasks = scheduler::spawn_core_tasks(state.scheduler_deps());

    let addr = cfg.server.socket_addr()?;
    info!(%addr, box_id = %state.box_id(), "starting battery box planner");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    warn!("http server stopped, draining core tasks");
    core_tasks.shutdown().await;
    info!("shutdown complete");
    Ok(())
}
