//! Operator console.
//!
//! One command per line: `list` shows the session table, `exit` shuts the
//! server down, anything else is broadcast to every connected session.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast as signal;

use crate::broadcast::broadcast;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// Operator typed `exit`; shutdown has been signalled.
    Shutdown,
    /// Input closed. The server keeps running.
    Eof,
}

pub const BANNER: &str = "Server console: 'list' shows connected sessions, 'exit' shuts down, \
anything else is broadcast to every session.\n";

pub async fn run_console<R, W>(
    input: R,
    mut output: W,
    registry: SessionRegistry,
    shutdown_tx: signal::Sender<()>,
) -> std::io::Result<ConsoleExit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(BANNER.as_bytes()).await?;
    output.flush().await?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "" => continue,
            "exit" => {
                output.write_all(b"Shutting down.\n").await?;
                output.flush().await?;
                tracing::info!("console: exit requested");
                let _ = shutdown_tx.send(());
                return Ok(ConsoleExit::Shutdown);
            }
            "list" => {
                let listing = render_sessions(&registry);
                output.write_all(listing.as_bytes()).await?;
            }
            _ => {
                let report = broadcast(&registry, &line);
                let summary = format!(
                    "Broadcast to {} session(s), {} failed.\n",
                    report.delivered, report.failed
                );
                output.write_all(summary.as_bytes()).await?;
            }
        }
        output.flush().await?;
    }

    tracing::info!("console: input closed");
    Ok(ConsoleExit::Eof)
}

fn render_sessions(registry: &SessionRegistry) -> String {
    let mut out = String::new();
    let mut count = 0usize;
    registry.for_each_active(|s| {
        count += 1;
        out.push_str(&format!(
            "[{}] {} {} {} ({}s)\n",
            s.slot,
            s.username.as_deref().unwrap_or("(unauthenticated)"),
            s.peer,
            s.state,
            s.connected_at.elapsed().as_secs()
        ));
    });
    out.push_str(&format!(
        "{count} of {} session slot(s) in use.\n",
        registry.capacity()
    ));
    out
}
