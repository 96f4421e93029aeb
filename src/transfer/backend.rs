//! Transport backends: `bbcp`, `rsync`, and a same-host copy fallback
//! (`spec.md` §4.7 step 2, §9 open question "bbcp/rsync preference").

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// A source location: either on this host (`user`/`host` both `None`)
/// or reachable over `ssh` as `user@host`.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub user: Option<String>,
    pub host: Option<String>,
    pub abs_path: PathBuf,
}

impl RemoteSpec {
    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }

    /// Render as a `bbcp`/`rsync` source argument: `user@host:/path` or
    /// a bare local path.
    fn as_transport_arg(&self) -> String {
        match (&self.user, &self.host) {
            (Some(user), Some(host)) => format!("{}@{}:{}", user, host, self.abs_path.display()),
            (None, Some(host)) => format!("{}:{}", host, self.abs_path.display()),
            _ => self.abs_path.display().to_string(),
        }
    }
}

/// Which backend a [`super::TransferEngine`] should prefer. `Auto`
/// falls back from `bbcp` to `rsync` to a local copy depending on
/// whether the source is remote and which binaries are configured;
/// `spec.md` §9 leaves the exact preference as an operator knob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Auto,
    Bbcp,
    Rsync,
    LocalCopy,
}

#[async_trait]
pub trait TransferBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn transfer(&self, source: &RemoteSpec, dest_abs: &Path, timeout: Duration) -> Result<()>;
}

pub struct BbcpBackend {
    pub binary: String,
}

#[async_trait]
impl TransferBackend for BbcpBackend {
    fn name(&self) -> &'static str {
        "bbcp"
    }

    async fn transfer(&self, source: &RemoteSpec, dest_abs: &Path, timeout: Duration) -> Result<()> {
        // `spec.md` §6 "Transfer wire": bbcp -f -e -E md5= -s 16 <src> <dst>.
        run_with_timeout(
            Command::new(&self.binary)
                .arg("-f")
                .arg("-e")
                .arg("-E")
                .arg("md5=")
                .arg("-s")
                .arg("16")
                .arg(source.as_transport_arg())
                .arg(dest_abs),
            timeout,
            "bbcp",
        )
        .await
    }
}

pub struct RsyncBackend {
    pub binary: String,
}

#[async_trait]
impl TransferBackend for RsyncBackend {
    fn name(&self) -> &'static str {
        "rsync"
    }

    async fn transfer(&self, source: &RemoteSpec, dest_abs: &Path, timeout: Duration) -> Result<()> {
        // `spec.md` §6: rsync -aH --inplace --partial-dir=.alpenhorn_partial <src> <dst>.
        run_with_timeout(
            Command::new(&self.binary)
                .arg("-aH")
                .arg("--inplace")
                .arg("--partial-dir=.alpenhorn_partial")
                .arg(source.as_transport_arg())
                .arg(dest_abs),
            timeout,
            "rsync",
        )
        .await
    }
}

/// Same-host transfers never need `ssh`; a plain streaming copy avoids
/// the subprocess overhead entirely.
pub struct LocalCopyBackend;

#[async_trait]
impl TransferBackend for LocalCopyBackend {
    fn name(&self) -> &'static str {
        "local-copy"
    }

    async fn transfer(&self, source: &RemoteSpec, dest_abs: &Path, _timeout: Duration) -> Result<()> {
        if !source.is_local() {
            bail!("local-copy backend given a remote source {:?}", source);
        }
        if let Some(parent) = dest_abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source.abs_path, dest_abs)
            .await
            .with_context(|| format!("copying {:?} -> {:?}", source.abs_path, dest_abs))?;
        Ok(())
    }
}

async fn run_with_timeout(cmd: &mut Command, timeout: Duration, name: &str) -> Result<()> {
    let child = cmd
        .stdin(std::process::Stdio::null())
        .spawn()
        .with_context(|| format!("spawning {}", name))?;

    let status = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .with_context(|| format!("{} timed out after {:?}", name, timeout))??;

    if !status.status.success() {
        bail!(
            "{} exited with {}: {}",
            name,
            status.status,
            String::from_utf8_lossy(&status.stderr)
        );
    }
    Ok(())
}

/// Choose a concrete backend for this pull. Same-host transfers always
/// use the local copy; otherwise honour the configured preference,
/// falling back to `rsync` (ubiquitous) when `bbcp` was requested but
/// the binary path wasn't configured.
pub fn select_backend(kind: BackendKind, source: &RemoteSpec, bbcp_path: &str, rsync_path: &str) -> Box<dyn TransferBackend> {
    if source.is_local() {
        return Box::new(LocalCopyBackend);
    }
    match kind {
        BackendKind::LocalCopy => Box::new(LocalCopyBackend),
        BackendKind::Bbcp => Box::new(BbcpBackend { binary: bbcp_path.to_string() }),
        BackendKind::Rsync => Box::new(RsyncBackend { binary: rsync_path.to_string() }),
        BackendKind::Auto => {
            if !bbcp_path.is_empty() {
                Box::new(BbcpBackend { binary: bbcp_path.to_string() })
            } else {
                Box::new(RsyncBackend { binary: rsync_path.to_string() })
            }
        }
    }
}
