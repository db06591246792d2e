// src/core/status.rs

//! A minimal read-only status listener: operators and health checks query
//! the running daemon's view of the cluster without touching the monitored
//! database directly. Grounded on the Warden's accept-loop/spawn-per-client
//! shape, stripped of the RESP wire format since this is a much smaller
//! surface than the full command API that loop served.

use crate::core::context::LoopContext;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct StatusReport {
    node_id: i32,
    primary_node_id: Option<i32>,
    monitoring_state: &'static str,
    degraded_since: Option<chrono::DateTime<chrono::Utc>>,
    paused: bool,
}

fn build_report(ctx: &LoopContext) -> StatusReport {
    ctx.with_state(|s| StatusReport {
        node_id: ctx.node_id,
        primary_node_id: s.primary_node_id,
        monitoring_state: match s.monitoring_state {
            crate::core::context::MonitoringState::Normal => "normal",
            crate::core::context::MonitoringState::Degraded => "degraded",
        },
        degraded_since: s.degraded_since,
        paused: ctx.flags.is_paused(),
    })
}

/// Binds `0.0.0.0:{port}` and serves one-line requests forever. Each
/// connection gets its own task, same as the Warden's listener; the only
/// command understood is `STATUS`, answered with a single JSON line.
pub async fn run_listener(port: u16, ctx: Arc<LoopContext>) -> std::io::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("status listener bound on port {}", port);

    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(socket, &ctx).await {
                        warn!("status connection from {} failed: {}", addr, e);
                    }
                });
            }
            Err(e) => warn!("failed to accept status connection: {}", e),
        }
    }
}

async fn handle_connection(socket: TcpStream, ctx: &LoopContext) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("status") {
            let report = build_report(ctx);
            let mut body = serde_json::to_string(&report).unwrap_or_else(|_| "{}".to_string());
            body.push('\n');
            write_half.write_all(body.as_bytes()).await?;
        } else if command.eq_ignore_ascii_case("ping") {
            write_half.write_all(b"PONG\n").await?;
        } else {
            write_half
                .write_all(format!("ERR unknown command '{command}'\n").as_bytes())
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_reflects_current_loop_state() {
        let ctx = LoopContext::new(3);
        ctx.with_state(|s| s.primary_node_id = Some(1));
        let report = build_report(&ctx);
        assert_eq!(report.node_id, 3);
        assert_eq!(report.primary_node_id, Some(1));
        assert_eq!(report.monitoring_state, "normal");
        assert!(!report.paused);
    }

    #[tokio::test]
    async fn status_command_round_trips_over_tcp() {
        let ctx = Arc::new(LoopContext::new(7));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx_clone = ctx.clone();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = handle_connection(socket, &ctx_clone).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"status\n").await.unwrap();
        let mut reader = BufReader::new(client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("\"node_id\":7"));
    }
}
