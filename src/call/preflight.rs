//! Reachability preflight: confirms the webhook and media-stream endpoints
//! are actually reachable before a call is placed, with a short success
//! cache so a burst of calls doesn't re-probe every time.

use crate::constants::{PREFLIGHT_CACHE_SECONDS, PREFLIGHT_TIMEOUT_MS, SELF_TEST_HEADER};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_tungstenite::connect_async;

pub struct Preflight {
    client: reqwest::Client,
    pub(crate) last_success_ms: AtomicI64,
}

impl Preflight {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            last_success_ms: AtomicI64::new(i64::MIN),
        }
    }

    fn is_loopback(host: &str) -> bool {
        host == "localhost" || host == "127.0.0.1" || host == "::1"
    }

    /// Run the HTTP and web-socket probes unless a success was cached
    /// within `PREFLIGHT_CACHE_SECONDS`.
    pub async fn check(
        &self,
        now_ms: i64,
        webhook_url: &str,
        webhook_host: &str,
        stream_ws_url: &str,
        boot_secret: &str,
    ) -> Result<(), String> {
        let cached = self.last_success_ms.load(Ordering::Relaxed);
        if now_ms - cached < (PREFLIGHT_CACHE_SECONDS as i64) * 1000 {
            return Ok(());
        }

        if !Self::is_loopback(webhook_host) {
            self.check_http(webhook_url, boot_secret).await?;
        }
        self.check_websocket(stream_ws_url).await?;

        self.last_success_ms.store(now_ms, Ordering::Relaxed);
        Ok(())
    }

    async fn check_http(&self, webhook_url: &str, boot_secret: &str) -> Result<(), String> {
        let response = tokio::time::timeout(
            Duration::from_millis(PREFLIGHT_TIMEOUT_MS),
            self.client
                .post(webhook_url)
                .header(SELF_TEST_HEADER, boot_secret)
                .send(),
        )
        .await
        .map_err(|_| format!("preflight HTTP probe to {webhook_url} timed out"))?
        .map_err(|e| format!("preflight HTTP probe to {webhook_url} failed: {e}"))?;

        if response.status().as_u16() != 200 {
            return Err(format!(
                "preflight HTTP probe to {webhook_url} returned {}",
                response.status()
            ));
        }
        Ok(())
    }

    async fn check_websocket(&self, stream_ws_url: &str) -> Result<(), String> {
        let (mut socket, _) = tokio::time::timeout(
            Duration::from_millis(PREFLIGHT_TIMEOUT_MS),
            connect_async(stream_ws_url),
        )
        .await
        .map_err(|_| format!("preflight web-socket probe to {stream_ws_url} timed out"))?
        .map_err(|e| format!("preflight web-socket probe to {stream_ws_url} failed: {e}"))?;

        use futures_util::SinkExt;
        let _ = socket.close(None).await;
        Ok(())
    }
}

impl Default for Preflight {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_loopback_hosts() {
        assert!(Preflight::is_loopback("127.0.0.1"));
        assert!(Preflight::is_loopback("localhost"));
        assert!(!Preflight::is_loopback("example.com"));
    }

    #[tokio::test]
    async fn caches_success_within_window() {
        let preflight = Preflight::new();
        preflight.last_success_ms.store(1_000, Ordering::Relaxed);
        // A non-loopback host would normally require network I/O; the cache
        // hit must short-circuit before any probe is attempted.
        let result = preflight
            .check(1_500, "https://example.com/hook", "example.com", "wss://example.com/s", "secret")
            .await;
        assert!(result.is_ok());
    }
}
