//! TCP ingest listener: decodes frame envelopes and feeds the engine.

use rollcall_wire::{read_envelope, WireError};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};

use crate::engine::EngineHandle;

/// Accept loop. Each connection is one camera pipeline; connections are
/// independent and any number may stream concurrently.
pub async fn serve(listener: TcpListener, engine: EngineHandle) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "ingest connection opened");
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine).await {
                tracing::warn!(%peer, error = %e, "ingest connection failed");
            }
            tracing::info!(%peer, "ingest connection closed");
        });
    }
}

/// Read envelopes until EOF. Each envelope becomes one observe message;
/// a malformed envelope terminates this connection only — the engine and
/// other connections are unaffected.
async fn handle_connection(stream: TcpStream, engine: EngineHandle) -> Result<(), WireError> {
    let mut reader = BufReader::new(stream);
    let mut last_at = None;

    while let Some(envelope) = read_envelope(&mut reader).await? {
        // Capture timestamps are non-decreasing per connection; a
        // regressed frame is stale (e.g. a camera switch mid-stream) and
        // is skipped. The tracker guards per-session regressions itself.
        if let Some(last) = last_at {
            if envelope.captured_at < last {
                tracing::warn!(
                    captured_at = %envelope.captured_at,
                    %last,
                    "out-of-order frame skipped"
                );
                continue;
            }
        }
        last_at = Some(envelope.captured_at);
        engine.observe(envelope.detections, envelope.captured_at);
    }
    Ok(())
}
