//! Module plugin protocol.
//!
//! Plugins are out-of-process provisioning backends reached over a
//! WebSocket. The engine only depends on the [`ModuleApplier`] and
//! [`ModuleBuilder`] traits; [`PluginManager`] is the docker-backed
//! implementation.

mod client;
mod manager;
mod server;
mod types;

pub use client::ModuleClient;
pub use manager::PluginManager;
pub use server::{CONTAINER_PORT, ModuleServer, READY_MARKER, parse_port};
pub use types::{
    ApplyRequest, ApplyResponse, BuildRequest, BuildResponse, PluginCommand, PluginKind,
    PluginMessage,
};

use async_trait::async_trait;
use std::path::Path;

use crate::error::PluginError;

/// Applies modules. The executor's only dependency on plugins.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleApplier: Send + Sync {
    /// Applies (or destroys, per `request.destroy`) one module.
    async fn apply(
        &self,
        plugin: PluginKind,
        request: ApplyRequest,
    ) -> Result<ApplyResponse, PluginError>;
}

/// Builds module source directories into images.
#[async_trait]
pub trait ModuleBuilder: Send + Sync {
    /// Builds `directory` with the given plugin and returns the image.
    async fn build(&self, plugin: PluginKind, directory: &Path) -> Result<String, PluginError>;
}
