use anyhow::Result;
use chrono::Utc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod ingest;
mod sink;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load()?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        absence_timeout_secs = config.absence_timeout_secs,
        tick_interval_secs = config.tick_interval_secs,
        "rollcalld starting"
    );

    let engine = engine::spawn_engine(config.tracker(), config.frame_queue_depth);

    let sink_task = tokio::spawn(sink::run_stdout_sink(engine.subscribe()));

    // The sweep runs independently of frame arrival, so absences are
    // detected even when no detections arrive at all. Timing derives from
    // the carried wall clock, so a missed interval self-corrects.
    let ticker = {
        let engine = engine.clone();
        let period = std::time::Duration::from_secs(config.tick_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                engine.tick(Utc::now());
            }
        })
    };

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "ingest listening");

    tokio::select! {
        result = ingest::serve(listener, engine.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "ingest listener failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("rollcalld shutting down");
        }
    }

    // Stop producing: no more ticks, no more frames. Closing the request
    // queue lets the engine drain in-flight work and exit without
    // synthesizing departures for sessions that were present at shutdown.
    ticker.abort();
    drop(engine);
    // Lingering ingest connections hold engine handles; give the sink a
    // moment to drain, then exit regardless.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), sink_task).await;

    Ok(())
}
