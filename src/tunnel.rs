//! Public URL discovery (§4.8): when no `publicUrl` is configured, spawn a
//! local tunnel helper and scrape its stdout for the origin the carrier
//! should call back to.

use crate::config::TunnelProvider;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{info, warn};

/// A running tunnel helper child process, kept alive for the lifetime of the
/// server and killed on shutdown.
pub struct TunnelHandle {
    child: Option<Child>,
    pub public_origin: String,
}

impl TunnelHandle {
    fn direct(public_origin: String) -> Self {
        Self { child: None, public_origin }
    }

    pub async fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

/// Resolve the origin (host[:port], no scheme) the carrier should use to
/// reach this server, per the priority order in §4.8: explicit `publicUrl`
/// wins, then a configured tunnel helper, then a bare loopback origin for
/// local development against a provider that doesn't need a public URL.
pub async fn discover(
    provider: TunnelProvider,
    port: u16,
    explicit_public_url: Option<&str>,
) -> Result<TunnelHandle, String> {
    if let Some(url) = explicit_public_url {
        return Ok(TunnelHandle::direct(strip_scheme(url)));
    }

    match provider {
        TunnelProvider::None => Ok(TunnelHandle::direct(format!("127.0.0.1:{port}"))),
        TunnelProvider::Ngrok => spawn_ngrok(port).await,
        TunnelProvider::TailscaleServe => spawn_tailscale(port, &["serve"]).await,
        TunnelProvider::TailscaleFunnel => spawn_tailscale(port, &["funnel"]).await,
    }
}

fn strip_scheme(url: &str) -> String {
    url.trim_start_matches("https://").trim_start_matches("http://").trim_end_matches('/').to_string()
}

/// `ngrok` prints its public URL on a `url=` line of its structured log
/// output once the tunnel is up; we scrape stdout for it rather than
/// shelling out to the local admin API, since the free tier doesn't always
/// expose it on a predictable port.
async fn spawn_ngrok(port: u16) -> Result<TunnelHandle, String> {
    let mut cmd = Command::new("ngrok");
    cmd.arg("http")
        .arg(port.to_string())
        .arg("--log=stdout")
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null());

    let mut child = cmd.spawn().map_err(|e| format!("failed to spawn ngrok: {e}"))?;
    let stdout = child.stdout.take().ok_or("ngrok stdout not piped")?;

    let origin = timeout(Duration::from_secs(15), scrape_url_line(stdout, "url="))
        .await
        .map_err(|_| "timed out waiting for ngrok tunnel to come up".to_string())??;

    info!(origin, "ngrok tunnel established");
    Ok(TunnelHandle { child: Some(child), public_origin: origin })
}

/// `tailscale serve`/`tailscale funnel` run in the foreground and print the
/// serving origin to stdout; both subcommands share this helper since the
/// only difference is the argument name.
async fn spawn_tailscale(port: u16, subcommand: &[&str]) -> Result<TunnelHandle, String> {
    let mut cmd = Command::new("tailscale");
    for arg in subcommand {
        cmd.arg(arg);
    }
    cmd.arg("--bg")
        .arg(port.to_string())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .stdin(std::process::Stdio::null());

    let mut child = cmd.spawn().map_err(|e| format!("failed to spawn tailscale: {e}"))?;
    let stdout = child.stdout.take().ok_or("tailscale stdout not piped")?;

    let origin = timeout(Duration::from_secs(15), scrape_url_line(stdout, "https://"))
        .await
        .map_err(|_| "timed out waiting for tailscale tunnel to come up".to_string())??;

    info!(origin, "tailscale tunnel established");
    Ok(TunnelHandle { child: Some(child), public_origin: origin })
}

async fn scrape_url_line(
    stdout: tokio::process::ChildStdout,
    marker: &str,
) -> Result<String, String> {
    let mut lines = BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("failed to read tunnel helper output: {e}"))?
    {
        if let Some(idx) = line.find(marker) {
            let rest = &line[idx + marker.len()..];
            let url = rest.split_whitespace().next().unwrap_or(rest);
            if url.starts_with("https://") || url.starts_with("http://") {
                return Ok(strip_scheme(url));
            }
        }
    }
    warn!("tunnel helper exited before printing a public URL");
    Err("tunnel helper closed stdout without reporting a URL".to_string())
}
