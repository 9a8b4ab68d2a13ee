//! Notification socket client (spec.md §6): on each notification the
//! service connects to a local byte-stream socket, writes one JSON message,
//! and closes. Failures are swallowed — best-effort, never blocking or
//! failing an operation (spec.md §8 property 9, bounded wait <= 1s).
//!
//! The transport itself (what reads the other end of the socket) is an
//! out-of-scope external collaborator per spec.md §1; this module only
//! owns the write side.

use std::time::Duration;

use serde::Serialize;
use slog::Logger;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use crate::GlobalLogger;

/// spec.md §9 Open Question (a): two socket paths existed historically;
/// this implementation standardizes on `/run/...` and falls back to the
/// legacy `/var/run/...` path if the former is absent, resolved once at
/// construction.
const PRIMARY_SOCKET: &str = "/run/mos-notify.sock";
const LEGACY_SOCKET: &str = "/var/run/mos-notify.sock";
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    Alert,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: Priority,
}

pub struct Notifier {
    socket_path: String,
    logger: Logger,
}

impl Default for Notifier {
    fn default() -> Self {
        let socket_path = if std::path::Path::new(PRIMARY_SOCKET).exists() {
            PRIMARY_SOCKET.to_string()
        } else {
            LEGACY_SOCKET.to_string()
        };
        Notifier { socket_path, logger: GlobalLogger::global().new(o!("module" => "notify")) }
    }
}

impl Notifier {
    pub fn with_socket_path(path: impl Into<String>) -> Self {
        Notifier { socket_path: path.into(), logger: GlobalLogger::global().new(o!("module" => "notify")) }
    }

    /// Best-effort send, bounded to ~1s total (property 9). Never returns an
    /// error to the caller — a failure here must never fail or delay the
    /// operation that triggered it.
    pub async fn send(&self, notification: Notification) {
        let result = tokio::time::timeout(CONNECT_TIMEOUT + WRITE_TIMEOUT, self.try_send(&notification)).await;
        match result {
            Ok(Ok(())) => {},
            Ok(Err(err)) => {
                warn!(self.logger, "notification send failed"; "error" => format_args!("{}", err));
            },
            Err(_) => {
                warn!(self.logger, "notification send timed out");
            },
        }
    }

    async fn try_send(&self, notification: &Notification) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let payload = serde_json::to_vec(notification)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        stream.write_all(&payload).await?;
        stream.shutdown().await?;
        Ok(())
    }

    pub async fn info(&self, title: impl Into<String>, message: impl Into<String>) {
        self.send(Notification { title: title.into(), message: message.into(), priority: Priority::Normal }).await;
    }

    pub async fn alert(&self, title: impl Into<String>, message: impl Into<String>) {
        self.send(Notification { title: title.into(), message: message.into(), priority: Priority::Alert }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_missing_socket_never_panics_or_blocks() {
        let notifier = Notifier::with_socket_path("/nonexistent/path/to.sock");
        let start = std::time::Instant::now();
        notifier.info("title", "message").await;
        assert!(start.elapsed() < Duration::from_secs(1), "must honor the bounded-wait property");
    }
}
