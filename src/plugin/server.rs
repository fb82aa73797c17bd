//! Plugin containers.
//!
//! Each plugin kind runs as a docker container exposing a WebSocket server
//! on [`CONTAINER_PORT`]. The host port is assigned by docker and read back
//! from `docker port`.

use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::client::ModuleClient;
use super::types::PluginKind;
use crate::error::PluginError;

/// Port the plugin listens on inside its container.
pub const CONTAINER_PORT: u16 = 50051;

/// Line printed by a plugin once it accepts connections.
pub const READY_MARKER: &str = "Started server on port";

/// Extracts the host port from `docker port` output.
#[must_use]
pub fn parse_port(output: &str) -> Option<u16> {
    let pattern = Regex::new(r"-> 0\.0\.0\.0:(\d{1,5})").ok()?;
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .and_then(|port| port.as_str().parse().ok())
}

/// A plugin container owned by this process.
#[derive(Debug)]
pub struct ModuleServer {
    plugin: PluginKind,
    image: String,
    container: String,
    startup_timeout: Duration,
    child: Option<Child>,
}

impl ModuleServer {
    /// Creates a server for `plugin` backed by `image`. Nothing runs until
    /// [`ModuleServer::start`].
    #[must_use]
    pub fn new(plugin: PluginKind, image: impl Into<String>) -> Self {
        Self {
            plugin,
            image: image.into(),
            container: format!("infragraph-{plugin}-plugin"),
            startup_timeout: Duration::from_secs(120),
            child: None,
        }
    }

    /// Sets how long to wait for the ready line.
    #[must_use]
    pub const fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Container name.
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container
    }

    /// Returns true while the container process is owned by this server.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn start_error(&self, message: impl Into<String>) -> PluginError {
        PluginError::ServerStart {
            plugin: self.plugin.to_string(),
            message: message.into(),
        }
    }

    /// Starts the container and waits until it is ready.
    ///
    /// `directory` is mounted at the same path inside the container, for
    /// builds.
    ///
    /// # Errors
    ///
    /// Returns an error if docker cannot be spawned, the container exits or
    /// times out before printing [`READY_MARKER`], or its port cannot be read.
    pub async fn start(&mut self, directory: Option<&Path>) -> Result<ModuleClient, PluginError> {
        info!("Starting {} plugin container {}", self.plugin, self.container);

        let mut command = Command::new("docker");
        command
            .args(["run", "--name", self.container.as_str(), "--rm", "-p"])
            .arg(CONTAINER_PORT.to_string())
            .args(["-v", "/var/run/docker.sock:/var/run/docker.sock"]);
        if let Some(directory) = directory {
            let directory = directory.display();
            command.arg("-v").arg(format!("{directory}:{directory}"));
        }
        command
            .arg(&self.image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| self.start_error(format!("failed to spawn docker: {e}")))?;

        if let Some(stderr) = child.stderr.take() {
            let container = self.container.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(container = %container, "{line}");
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.start_error("container stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();

        let ready = tokio::time::timeout(self.startup_timeout, async {
            while let Some(line) = lines.next_line().await? {
                debug!(container = %self.container, "{line}");
                if line.contains(READY_MARKER) {
                    return Ok(true);
                }
            }
            Ok::<_, std::io::Error>(false)
        })
        .await;

        match ready {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(self.start_error("container exited before it was ready")),
            Ok(Err(e)) => return Err(self.start_error(e.to_string())),
            Err(_) => {
                let _ = child.kill().await;
                return Err(self.start_error(format!(
                    "not ready after {}s",
                    self.startup_timeout.as_secs()
                )));
            }
        }

        let container = self.container.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(container = %container, "{line}");
            }
        });

        let port = self.discover_port().await?;
        info!("{} plugin ready on port {port}", self.plugin);
        self.child = Some(child);
        Ok(ModuleClient::new(port))
    }

    async fn discover_port(&self) -> Result<u16, PluginError> {
        let fail = |message: String| PluginError::PortDiscovery {
            plugin: self.plugin.to_string(),
            message,
        };
        let output = Command::new("docker")
            .args(["port", self.container.as_str()])
            .output()
            .await
            .map_err(|e| fail(e.to_string()))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_port(&stdout).ok_or_else(|| fail(format!("no host port in '{}'", stdout.trim())))
    }

    /// Stops the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be killed.
    pub async fn stop(&mut self) -> Result<(), PluginError> {
        if let Some(mut child) = self.child.take() {
            info!("Stopping {} plugin container", self.plugin);
            child
                .kill()
                .await
                .map_err(|e| self.start_error(format!("failed to stop container: {e}")))?;
        }
        Ok(())
    }
}
