//! Log sink: writes emitted events as JSON lines on stdout, the contract
//! the dashboard's supervising process consumes.

use rollcall_core::Event;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

/// Consume the event stream until it closes. The sink is a pure consumer:
/// if it lags, events are skipped with a warning and the engine is never
/// stalled; durability belongs to whoever reads our stdout.
pub async fn run_stdout_sink(mut rx: broadcast::Receiver<Event>) {
    let mut stdout = tokio::io::stdout();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let mut line = match serde_json::to_vec(&event) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "event serialization failed");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = stdout.write_all(&line).await {
                    tracing::error!(error = %e, "stdout sink write failed; sink stopping");
                    break;
                }
                let _ = stdout.flush().await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "log sink lagging; events skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    tracing::info!("log sink stopped");
}
