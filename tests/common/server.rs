//! Test server management.
//!
//! Spawns and manages towerd instances for integration testing. Limits
//! are deliberately tight so escalation can be driven in a few calls.

#![allow(dead_code)]

use std::process::{Child, Command};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::sleep;

/// Admin token written into every test configuration.
pub const ADMIN_TOKEN: &str = "test-admin-token";

/// A test server instance.
///
/// The child process is killed on drop; use [`TestServer::stop`] to keep
/// the data directory for a restart.
pub struct TestServer {
    child: Option<Child>,
    port: u16,
    data_dir: Option<TempDir>,
}

impl TestServer {
    /// Spawn a new test server on a fresh data directory.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_in(tempfile::tempdir()?).await
    }

    /// Spawn a test server reusing an existing data directory.
    ///
    /// The database file persists across spawns, so this simulates a
    /// daemon restart.
    pub async fn spawn_in(data_dir: TempDir) -> anyhow::Result<Self> {
        let port = free_port()?;

        let config_path = data_dir.path().join("tower.toml");
        let config_content = format!(
            r#"
[listen]
addr = "127.0.0.1:{port}"

[database]
path = "{db}"

[limits]
request_window_secs = 1
request_limit = 5
throttle_window_secs = 10
throttle_limit = 3
ban_duration_secs = 2

[cleanup]
interval_secs = 0

[admin]
token = "{token}"
"#,
            port = port,
            db = data_dir.path().join("tower.db").display(),
            token = ADMIN_TOKEN,
        );
        std::fs::write(&config_path, config_content)?;

        let child = Command::new(env!("CARGO_BIN_EXE_towerd"))
            .arg(&config_path)
            .spawn()?;

        let server = Self {
            child: Some(child),
            port,
            data_dir: Some(data_dir),
        };
        server.wait_ready().await?;
        Ok(server)
    }

    /// Full URL for an API path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// Stop the server and hand back the data directory for a restart.
    pub fn stop(mut self) -> TempDir {
        self.kill();
        self.data_dir.take().expect("data dir present")
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Poll the health endpoint until the server answers.
    async fn wait_ready(&self) -> anyhow::Result<()> {
        let client = reqwest::Client::new();
        for _ in 0..100 {
            if let Ok(response) = client.get(self.url("/healthz")).send().await
                && response.status().is_success()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
        anyhow::bail!("server did not become ready on port {}", self.port)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Reserve an ephemeral port.
///
/// The listener is dropped before the server binds; the race window is
/// tolerable for tests.
fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
