//! TCP front: one task per connection, line-oriented request/response.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use meteor_common::types::ConnId;

use crate::db::Database;

/// Suggested read chunk; a request is a single command within one chunk.
const READ_BUFFER_SIZE: usize = 4096;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Accept connections on `addr` until `shutdown` resolves.
pub async fn serve(
    db: Arc<Database>,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Server started");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, closing listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let conn = ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed));
                        tracing::info!(%conn, %peer, "Accepted connection");
                        let db = db.clone();
                        tokio::spawn(async move {
                            handle_connection(db, socket, conn).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}

/// Serve one connection: read a command, execute, reply, repeat.
/// Operations on a single connection are serially ordered.
async fn handle_connection(db: Arc<Database>, mut socket: TcpStream, conn: ConnId) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match socket.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(%conn, error = %e, "read failed");
                break;
            }
        };

        let line = String::from_utf8_lossy(&buffer[..n]);
        let response = db.dispatch(line.trim(), conn).await;

        if let Err(e) = socket.write_all(&response).await {
            tracing::debug!(%conn, error = %e, "write failed");
            break;
        }
    }
    tracing::info!(%conn, "Connection closed");
}
