//! Provider configuration and remote registry.
//!
//! A provider holds the set of named remotes (hypervisor servers) the engine
//! can talk to. Remotes are registered once at startup and resolved by name
//! per operation; the registry is read-mostly and safe to share across
//! concurrent reconciliations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;
use virtstate_client::{ImageServer, InstanceServer};

use crate::error::{EngineError, Result};
use crate::poll::PollConfig;

/// Poll timing settings, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PollSettings {
    pub delay_secs: u64,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            delay_secs: 2,
            min_interval_secs: 2,
            max_interval_secs: 10,
            timeout_secs: 180,
        }
    }
}

impl PollSettings {
    pub fn to_poll_config(&self) -> PollConfig {
        PollConfig {
            delay: Duration::from_secs(self.delay_secs),
            min_interval: Duration::from_secs(self.min_interval_secs),
            max_interval: Duration::from_secs(self.max_interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Remote used when a model does not name one.
    pub default_remote: String,
    /// Project used when a model does not name one.
    pub default_project: String,
    pub poll: PollSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            default_remote: "local".to_string(),
            default_project: "default".to_string(),
            poll: PollSettings::default(),
        }
    }
}

impl ProviderSettings {
    /// Load settings from an optional TOML file plus `VIRTSTATE_*`
    /// environment variables, falling back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("VIRTSTATE").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

/// Registry of named remotes plus the settings shared by all operations.
///
/// Instance servers are scoped per (remote, project) pair: the same remote
/// serves each project through a separate handle. Image servers are not
/// project-scoped.
pub struct Provider {
    settings: ProviderSettings,
    instance_remotes: RwLock<HashMap<(String, String), Arc<dyn InstanceServer>>>,
    image_remotes: RwLock<HashMap<String, Arc<dyn ImageServer>>>,
}

impl Provider {
    pub fn new(settings: ProviderSettings) -> Self {
        info!(default_remote = %settings.default_remote, "Creating provider");
        Self {
            settings,
            instance_remotes: RwLock::new(HashMap::new()),
            image_remotes: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn poll_config(&self) -> PollConfig {
        self.settings.poll.to_poll_config()
    }

    /// Register a full instance server under `name` in the default project.
    ///
    /// The remote also serves images, so it is added to both registries;
    /// inserting the concrete type twice sidesteps any cast between the two
    /// trait objects.
    pub fn register<S>(&self, name: &str, server: Arc<S>)
    where
        S: InstanceServer + 'static,
    {
        let project = self.settings.default_project.clone();
        self.register_with_project(name, &project, server);
    }

    /// Register an instance server under `name`, scoped to `project`.
    pub fn register_with_project<S>(&self, name: &str, project: &str, server: Arc<S>)
    where
        S: InstanceServer + 'static,
    {
        info!(remote = %name, project = %project, "Registering instance remote");
        self.image_remotes
            .write()
            .unwrap()
            .insert(name.to_string(), server.clone());
        self.instance_remotes
            .write()
            .unwrap()
            .insert((name.to_string(), project.to_string()), server);
    }

    /// Register an image-only remote (e.g. a public image server).
    pub fn register_image_server(&self, name: &str, server: Arc<dyn ImageServer>) {
        info!(remote = %name, "Registering image remote");
        self.image_remotes
            .write()
            .unwrap()
            .insert(name.to_string(), server);
    }

    /// The remote name an operation should use for `requested`.
    pub fn remote_name(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_remote.clone())
    }

    /// The project name an operation should use for `requested`.
    pub fn project_name(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.default_project.clone())
    }

    /// Resolve an instance server by remote and project name, `None` meaning
    /// the respective default.
    pub fn instance_server(
        &self,
        remote: Option<&str>,
        project: Option<&str>,
    ) -> Result<Arc<dyn InstanceServer>> {
        let name = self.remote_name(remote);
        let project = self.project_name(project);
        self.instance_remotes
            .read()
            .unwrap()
            .get(&(name.clone(), project.clone()))
            .cloned()
            .ok_or_else(|| EngineError::UnknownRemote(format!("{name} (project {project})")))
    }

    /// Resolve an image server by remote name, `None` meaning the default.
    pub fn image_server(&self, remote: Option<&str>) -> Result<Arc<dyn ImageServer>> {
        let name = self.remote_name(remote);
        self.image_remotes
            .read()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or(EngineError::UnknownRemote(name))
    }
}
