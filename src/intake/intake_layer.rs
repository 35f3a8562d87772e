// Intake layer - JSON-lines front end over any async reader/writer.
//
// `main` wires this to stdin/stdout. Each non-empty input line is one
// request; each gets exactly one response line.

#[path = "commands.rs"]
pub mod commands;

use crate::core::moderation::ModerationService;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Serves requests until the input closes or `shutdown` flips to `true`.
pub async fn run<R, W>(
    service: Arc<ModerationService>,
    reader: R,
    mut writer: W,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };
        let Some(line) = line else {
            tracing::info!("Intake input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = commands::handle_line(&service, &line).await;
        let mut encoded = serde_json::to_string(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}
