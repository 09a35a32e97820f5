//! Dashboard computer proxy
//!
//! Scoped capability for talking to the paired DBC over the private
//! point-to-point link. `enable` runs the link bring-up script, waits for
//! SSH to become reachable and starts a file server the DBC can download
//! from; `disable` tears all of that down again. File copies and remote
//! commands are only valid in between.

use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::Router;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::utils;

/// DBC address on the point-to-point link
const DBC_HOST: &str = "192.168.7.2";

/// Our own address on the link, where the file server binds
const LOCAL_HTTP_ADDR: &str = "192.168.7.1:31337";

/// Directory served to the DBC for downloads
pub const DBC_DATA_DIR: &str = "/data/dbc";

/// Script toggling the DBC link
const LINK_SCRIPT: &str = "/usr/bin/keycard.sh";

/// How long to wait for the DBC to answer on SSH
const REACHABLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Probe interval while waiting
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Per-probe connect timeout
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period for the file server on disable
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const SSH_OPTIONS: [&str; 4] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
];

struct FileServer {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct DbcState {
    enabled: bool,
    server: Option<FileServer>,
}

pub struct DbcProxy {
    data_dir: PathBuf,
    state: Mutex<DbcState>,
}

impl DbcProxy {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            state: Mutex::new(DbcState::default()),
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.lock().await.enabled
    }

    /// Bring the link up and wait for the DBC. Idempotent.
    pub async fn enable(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.enabled {
            return Ok(());
        }

        info!("enabling DBC interface");
        run_link_script().await?;
        wait_reachable(cancel).await?;
        info!("DBC is now reachable");

        state.server = Some(start_file_server(&self.data_dir).await?);
        state.enabled = true;
        Ok(())
    }

    /// Stop the file server and bring the link back down. Idempotent.
    pub async fn disable(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.enabled {
            return Ok(());
        }

        info!("disabling DBC interface");
        if let Some(server) = state.server.take() {
            server.shutdown.cancel();
            if tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server.task)
                .await
                .is_err()
            {
                warn!("file server did not stop in time");
            }
        }

        run_link_script().await?;
        state.enabled = false;
        Ok(())
    }

    /// Copy a local file onto the DBC via scp
    pub async fn copy_file(&self, local: &Path, remote: &Path) -> Result<()> {
        if !self.is_enabled().await {
            return Err(ServiceError::DbcNotEnabled);
        }

        let local = local.display().to_string();
        let out = utils::run(
            "scp",
            SSH_OPTIONS
                .iter()
                .map(|s| s.to_string())
                .chain([local.clone(), remote_target(remote)]),
        )
        .await?;
        if !out.success {
            return Err(ServiceError::Copy(format!(
                "scp {local} to DBC failed: {}",
                out.detail
            )));
        }
        debug!("copied {local} to DBC at {}", remote.display());
        Ok(())
    }

    /// Run a command on the DBC via ssh, returning its trimmed stdout
    pub async fn run_command(&self, command: &str) -> Result<String> {
        if !self.is_enabled().await {
            return Err(ServiceError::DbcNotEnabled);
        }

        let out = utils::run(
            "ssh",
            SSH_OPTIONS
                .iter()
                .map(|s| s.to_string())
                .chain([ssh_login(), command.to_string()]),
        )
        .await?;
        if !out.success {
            return Err(ServiceError::Ssh(format!("{command}: {}", out.detail)));
        }
        Ok(out.stdout)
    }
}

/// scp destination for a path on the DBC
fn remote_target(remote: &Path) -> String {
    format!("root@{DBC_HOST}:{}", remote.display())
}

fn ssh_login() -> String {
    format!("root@{DBC_HOST}")
}

async fn run_link_script() -> Result<()> {
    let out = utils::run(LINK_SCRIPT, Vec::<String>::new()).await?;
    if !out.success {
        return Err(ServiceError::DbcLink(out.detail));
    }
    Ok(())
}

/// Probe SSH on the DBC until it answers, the deadline passes or the token
/// is cancelled
async fn wait_reachable(cancel: &CancellationToken) -> Result<()> {
    let deadline = tokio::time::Instant::now() + REACHABLE_TIMEOUT;
    let mut ticker = tokio::time::interval(PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ServiceError::DbcCancelled),
            _ = ticker.tick() => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ServiceError::DbcTimeout);
                }
                let probe = TcpStream::connect((DBC_HOST, 22));
                if let Ok(Ok(_)) = tokio::time::timeout(PROBE_CONNECT_TIMEOUT, probe).await {
                    return Ok(());
                }
                debug!("DBC not reachable yet");
            }
        }
    }
}

/// Start the download server the DBC pulls files from
async fn start_file_server(data_dir: &Path) -> Result<FileServer> {
    let app = Router::new().fallback_service(ServeDir::new(data_dir));
    let listener = tokio::net::TcpListener::bind(LOCAL_HTTP_ADDR).await?;
    info!(
        "serving {} to the DBC on {LOCAL_HTTP_ADDR}",
        data_dir.display()
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!("DBC file server error: {e}");
        }
    });
    Ok(FileServer { shutdown, task })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_operations_require_enable() {
        let proxy = DbcProxy::new("/data/dbc");
        assert!(!proxy.is_enabled().await);

        let err = proxy
            .copy_file(Path::new("/tmp/a"), Path::new("/data/ota/a"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::DbcNotEnabled));

        let err = proxy.run_command("uname -a").await.unwrap_err();
        assert!(matches!(err, ServiceError::DbcNotEnabled));
    }

    #[tokio::test]
    async fn test_disable_without_enable_is_noop() {
        let proxy = DbcProxy::new("/data/dbc");
        proxy.disable().await.unwrap();
        assert!(!proxy.is_enabled().await);
    }

    #[test]
    fn test_remote_target_shaping() {
        assert_eq!(
            remote_target(Path::new("/data/maps/map.mbtiles")),
            "root@192.168.7.2:/data/maps/map.mbtiles"
        );
        assert_eq!(ssh_login(), "root@192.168.7.2");
    }
}
