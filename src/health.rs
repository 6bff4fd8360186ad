//! HTTP health endpoint
//!
//! Operational side-channel for deployment tooling. Serves `GET /health` with
//! uptime, memory use and room/player counts from a background thread so it never
//! competes with the WebSocket runtime.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Failed to bind health endpoint to {addr}: {error}")]
    Bind { addr: String, error: String },
}

/// Counters shared between rooms and the health endpoint
#[derive(Debug)]
pub struct ServerStats {
    started_at: Instant,
    rooms: AtomicUsize,
    players: AtomicUsize,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            rooms: AtomicUsize::new(0),
            players: AtomicUsize::new(0),
        }
    }

    pub fn room_opened(&self) {
        self.rooms.fetch_add(1, Ordering::Relaxed);
    }

    pub fn room_closed(&self) {
        let _ = self
            .rooms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
    }

    /// Apply a room's player count change from `before` to `after`
    pub fn adjust_players(&self, before: usize, after: usize) {
        if after > before {
            self.players.fetch_add(after - before, Ordering::Relaxed);
        } else if before > after {
            let delta = before - after;
            let _ = self
                .players
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(n.saturating_sub(delta))
                });
        }
    }

    pub fn snapshot(&self) -> HealthReport {
        HealthReport {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            memory_rss_bytes: resident_memory_bytes(),
            rooms: self.rooms.load(Ordering::Relaxed),
            players: self.players.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub version: String,
    pub uptime_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_rss_bytes: Option<u64>,
    pub rooms: usize,
    pub players: usize,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Resident set size of this process, where the platform exposes it
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

/// Map a request line to a status code and JSON body
fn route(method: &Method, url: &str, stats: &ServerStats) -> serde_json::Result<(u16, String)> {
    let path = url.split_once('?').map_or(url, |(path, _)| path);
    match (method, path) {
        (&Method::Get, "/health") => Ok((200, serde_json::to_string(&stats.snapshot())?)),
        (&Method::Get, _) => Ok((
            404,
            serde_json::to_string(&ErrorBody {
                error: format!("No route for {}", path),
            })?,
        )),
        _ => Ok((
            405,
            serde_json::to_string(&ErrorBody {
                error: format!("Method {} not allowed", method),
            })?,
        )),
    }
}

/// HTTP server for the health endpoint, running on its own thread
pub struct HealthServer {
    addr: String,
    local_addr: Option<SocketAddr>,
    server: Option<Arc<Server>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            local_addr: None,
            server: None,
            handle: None,
        }
    }

    /// Bind and start serving on a background thread
    pub fn start(&mut self, stats: Arc<ServerStats>) -> Result<(), HealthError> {
        let server = Server::http(&self.addr).map_err(|e| HealthError::Bind {
            addr: self.addr.clone(),
            error: e.to_string(),
        })?;
        let server = Arc::new(server);
        self.local_addr = server.server_addr().to_ip();
        info!(
            "Health endpoint listening on http://{}/health",
            self.local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| self.addr.clone())
        );

        let worker = Arc::clone(&server);
        let handle = thread::spawn(move || {
            for request in worker.incoming_requests() {
                if let Err(e) = Self::handle_request(request, &stats) {
                    warn!("Health endpoint error: {}", e);
                }
            }
            debug!("Health endpoint thread exiting");
        });

        self.server = Some(server);
        self.handle = Some(handle);
        Ok(())
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting requests and join the worker thread
    pub fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.unblock();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Health endpoint thread panicked");
            }
        }
    }

    fn handle_request(
        request: Request,
        stats: &ServerStats,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (status, body) = route(request.method(), request.url(), stats)?;
        let mut response = Response::from_string(body).with_status_code(status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]) {
            response = response.with_header(header);
        }
        request.respond(response)?;
        Ok(())
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.stop();
    }
}
