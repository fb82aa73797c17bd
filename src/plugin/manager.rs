//! Lazily started plugin containers shared across a run.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::warn;

use super::client::ModuleClient;
use super::server::ModuleServer;
use super::types::{ApplyRequest, ApplyResponse, BuildRequest, PluginKind};
use super::{ModuleApplier, ModuleBuilder};
use crate::error::PluginError;

/// Starts one container per plugin kind on first use and routes requests to it.
#[derive(Debug)]
pub struct PluginManager {
    image_prefix: String,
    mount: Option<PathBuf>,
    running: Mutex<HashMap<PluginKind, (ModuleServer, ModuleClient)>>,
}

impl PluginManager {
    /// Creates a manager. Plugin images are named `<prefix><plugin>-plugin`.
    #[must_use]
    pub fn new(image_prefix: impl Into<String>) -> Self {
        Self {
            image_prefix: image_prefix.into(),
            mount: None,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Mounts `directory` into every plugin container.
    #[must_use]
    pub fn with_mount(mut self, directory: impl Into<PathBuf>) -> Self {
        self.mount = Some(directory.into());
        self
    }

    /// Image used for a plugin kind.
    #[must_use]
    pub fn image_for(&self, plugin: PluginKind) -> String {
        format!("{}{plugin}-plugin", self.image_prefix)
    }

    async fn client(&self, plugin: PluginKind) -> Result<ModuleClient, PluginError> {
        let mut running = self.running.lock().await;
        if let Some((_, client)) = running.get(&plugin) {
            return Ok(client.clone());
        }

        let mut server = ModuleServer::new(plugin, self.image_for(plugin));
        let client = server.start(self.mount.as_deref()).await?;
        running.insert(plugin, (server, client.clone()));
        Ok(client)
    }

    /// Stops every container started by this manager.
    pub async fn shutdown(&self) {
        let mut running = self.running.lock().await;
        for (plugin, (mut server, _)) in running.drain() {
            if let Err(e) = server.stop().await {
                warn!("Failed to stop {plugin} plugin: {e}");
            }
        }
    }
}

#[async_trait]
impl ModuleApplier for PluginManager {
    async fn apply(
        &self,
        plugin: PluginKind,
        request: ApplyRequest,
    ) -> Result<ApplyResponse, PluginError> {
        self.client(plugin).await?.apply(&request).await
    }
}

#[async_trait]
impl ModuleBuilder for PluginManager {
    async fn build(&self, plugin: PluginKind, directory: &Path) -> Result<String, PluginError> {
        let request = BuildRequest {
            directory: directory.display().to_string(),
        };
        Ok(self.client(plugin).await?.build(&request).await?.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_naming() {
        let manager = PluginManager::new("ghcr.io/acme/");
        assert_eq!(manager.image_for(PluginKind::Pulumi), "ghcr.io/acme/pulumi-plugin");
    }
}
