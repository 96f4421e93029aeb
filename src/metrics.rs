//! Minimal Prometheus-text metrics endpoint (`spec.md` §9 open
//! question: "exact shape of a metrics endpoint is left to the
//! implementation"). Counters only; no dependency on a full metrics
//! crate since the surface is this small.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

#[derive(Default)]
struct Counters {
    files_imported: AtomicU64,
    files_pulled: AtomicU64,
    files_deleted: AtomicU64,
    pull_failures: AtomicU64,
    ticks_completed: AtomicU64,
}

/// Cheap, cloneable handle passed to every subsystem that wants to
/// bump a counter.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<Counters>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn inc_imported(&self) {
        self.counters.files_imported.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_pulled(&self) {
        self.counters.files_pulled.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_deleted(&self) {
        self.counters.files_deleted.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_pull_failure(&self) {
        self.counters.pull_failures.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_tick(&self) {
        self.counters.ticks_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self) -> String {
        let c = &self.counters;
        format!(
            "# TYPE alpenhorn_files_imported_total counter\n\
             alpenhorn_files_imported_total {}\n\
             # TYPE alpenhorn_files_pulled_total counter\n\
             alpenhorn_files_pulled_total {}\n\
             # TYPE alpenhorn_files_deleted_total counter\n\
             alpenhorn_files_deleted_total {}\n\
             # TYPE alpenhorn_pull_failures_total counter\n\
             alpenhorn_pull_failures_total {}\n\
             # TYPE alpenhorn_ticks_completed_total counter\n\
             alpenhorn_ticks_completed_total {}\n",
            c.files_imported.load(Ordering::Relaxed),
            c.files_pulled.load(Ordering::Relaxed),
            c.files_deleted.load(Ordering::Relaxed),
            c.pull_failures.load(Ordering::Relaxed),
            c.ticks_completed.load(Ordering::Relaxed),
        )
    }

    /// Serve `GET /metrics` on `port` until the process exits. Any
    /// other path gets a bare 404; this is not a general-purpose HTTP
    /// server.
    pub async fn serve(self, port: u16) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("binding metrics listener on port {}", port))?;
        log::info!("metrics endpoint listening on :{}", port);

        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    log::warn!("metrics listener accept failed: {}", e);
                    continue;
                }
            };
            let body = self.render();
            tokio::spawn(async move {
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_counter_name() {
        let m = Metrics::new();
        m.inc_imported();
        m.inc_pulled();
        let rendered = m.render();
        assert!(rendered.contains("alpenhorn_files_imported_total 1"));
        assert!(rendered.contains("alpenhorn_files_pulled_total 1"));
        assert!(rendered.contains("alpenhorn_ticks_completed_total 0"));
    }
}
