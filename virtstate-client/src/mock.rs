//! Mock hypervisor server for testing and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::api::*;
use crate::error::{ClientError, Result};
use crate::server::{CompletedOperation, ImageServer, InstanceServer, Operation};

/// Mock server that simulates instance operations in memory.
///
/// Useful for:
/// - Unit and integration testing of the engine
/// - Development without a reachable hypervisor
///
/// Mutations are applied synchronously and returned as already-completed
/// operations. Guest-agent attach latency can be simulated with
/// [`MockServer::set_agent_delay`]: a started instance then reports zero
/// processes for that many state fetches before turning operational.
pub struct MockServer {
    protocol: String,
    clustered: bool,
    location: String,
    state: RwLock<MockState>,
}

#[derive(Default)]
struct MockState {
    instances: HashMap<String, MockInstance>,
    images: HashMap<String, Image>,
    aliases: HashMap<String, String>,
    snapshots: HashMap<String, HashMap<String, InstanceSnapshot>>,
    files: HashMap<String, HashMap<String, FilePayload>>,
    backup_pools: HashMap<String, Option<String>>,
}

struct MockInstance {
    instance: Instance,
    processes: i64,
    network: HashMap<String, InstanceStateNetwork>,
    agent_ticks: u32,
    etag: Etag,
}

impl MockInstance {
    fn new(instance: Instance) -> Self {
        Self {
            instance,
            processes: 0,
            network: HashMap::new(),
            agent_ticks: 0,
            etag: Uuid::new_v4().to_string(),
        }
    }

    fn set_status(&mut self, code: StatusCode) {
        self.instance.status_code = code;
        self.instance.status = code.as_str().to_string();
        self.etag = Uuid::new_v4().to_string();
    }
}

fn instance_not_found(name: &str) -> ClientError {
    ClientError::NotFound(format!("instance {name:?}"))
}

impl MockServer {
    /// Create a new standalone mock server speaking the native protocol.
    pub fn new() -> Self {
        info!("Creating mock hypervisor server");
        Self {
            protocol: "incus".to_string(),
            clustered: false,
            location: "none".to_string(),
            state: RwLock::new(MockState::default()),
        }
    }

    /// Override the reported wire protocol (e.g. "simplestreams").
    pub fn with_protocol(mut self, protocol: &str) -> Self {
        self.protocol = protocol.to_string();
        self
    }

    /// Make the server report as clustered, placing instances on `location`.
    pub fn with_clustered(mut self, location: &str) -> Self {
        self.clustered = true;
        self.location = location.to_string();
        self
    }

    /// Register an image.
    pub fn add_image(&self, image: Image) {
        let mut state = self.state.write().unwrap();
        state.images.insert(image.fingerprint.clone(), image);
    }

    /// Register an alias pointing at a fingerprint.
    pub fn add_alias(&self, name: &str, fingerprint: &str) {
        let mut state = self.state.write().unwrap();
        state
            .aliases
            .insert(name.to_string(), fingerprint.to_string());
    }

    /// Register a snapshot for an existing instance.
    pub fn add_snapshot(&self, instance: &str, snapshot: InstanceSnapshot) {
        let mut state = self.state.write().unwrap();
        state
            .snapshots
            .entry(instance.to_string())
            .or_default()
            .insert(snapshot.name.clone(), snapshot);
    }

    /// Replace the reported network map of an instance.
    pub fn set_network(&self, name: &str, network: HashMap<String, InstanceStateNetwork>) {
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state.instances.get_mut(name) {
            entry.network = network;
        }
    }

    /// Delay guest-agent attach by `ticks` state fetches after the next start.
    pub fn set_agent_delay(&self, name: &str, ticks: u32) {
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state.instances.get_mut(name) {
            entry.agent_ticks = ticks;
        }
    }

    /// Inject extra config keys, as a server would for managed keys.
    pub fn set_config_keys(&self, name: &str, keys: &[(&str, &str)]) {
        let mut state = self.state.write().unwrap();
        if let Some(entry) = state.instances.get_mut(name) {
            for (k, v) in keys {
                entry
                    .instance
                    .config
                    .insert(k.to_string(), v.to_string());
            }
        }
    }

    /// Whether an instance currently exists.
    pub fn has_instance(&self, name: &str) -> bool {
        self.state.read().unwrap().instances.contains_key(name)
    }

    /// Files currently pushed into an instance, keyed by target path.
    pub fn files_of(&self, name: &str) -> HashMap<String, FilePayload> {
        self.state
            .read()
            .unwrap()
            .files
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Pool override recorded for a backup restore, if any.
    pub fn backup_pool_of(&self, name: &str) -> Option<Option<String>> {
        self.state.read().unwrap().backup_pools.get(name).cloned()
    }

    fn insert_instance(&self, name: &str, mut instance: Instance) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.instances.contains_key(name) {
            return Err(ClientError::Api(format!(
                "instance {name:?} already exists"
            )));
        }

        instance.name = name.to_string();
        instance.location = self.location.clone();
        instance
            .config
            .entry("volatile.uuid".to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        instance.created_at = Some(chrono::Utc::now());

        let mut entry = MockInstance::new(instance);
        entry.set_status(StatusCode::Stopped);
        state.instances.insert(name.to_string(), entry);
        Ok(())
    }
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageServer for MockServer {
    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            protocol: self.protocol.clone(),
            addresses: vec!["mock:8443".to_string()],
        }
    }

    async fn get_image_alias(&self, name: &str) -> Result<ImageAlias> {
        let state = self.state.read().unwrap();
        let target = state
            .aliases
            .get(name)
            .ok_or_else(|| ClientError::NotFound(format!("image alias {name:?}")))?;

        Ok(ImageAlias {
            name: name.to_string(),
            target: target.clone(),
        })
    }

    async fn get_image(&self, fingerprint: &str) -> Result<Image> {
        let state = self.state.read().unwrap();
        state
            .images
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("image {fingerprint:?}")))
    }
}

#[async_trait]
impl InstanceServer for MockServer {
    async fn get_instance(&self, name: &str) -> Result<(Instance, Etag)> {
        let state = self.state.read().unwrap();
        let entry = state
            .instances
            .get(name)
            .ok_or_else(|| instance_not_found(name))?;

        Ok((entry.instance.clone(), entry.etag.clone()))
    }

    async fn get_instance_state(&self, name: &str) -> Result<(InstanceState, Etag)> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .instances
            .get_mut(name)
            .ok_or_else(|| instance_not_found(name))?;

        // Simulate delayed guest-agent attach: the process count stays at
        // zero for a configured number of fetches after a start.
        if entry.instance.status_code == StatusCode::Running && entry.processes == 0 {
            if entry.agent_ticks > 0 {
                entry.agent_ticks -= 1;
            }
            if entry.agent_ticks == 0 {
                entry.processes = 1;
            }
        }

        let runtime = InstanceState {
            status: entry.instance.status.clone(),
            status_code: entry.instance.status_code,
            processes: entry.processes,
            network: entry.network.clone(),
        };
        Ok((runtime, entry.etag.clone()))
    }

    async fn get_instance_snapshot(
        &self,
        instance: &str,
        snapshot: &str,
    ) -> Result<(InstanceSnapshot, Etag)> {
        let state = self.state.read().unwrap();
        let snap = state
            .snapshots
            .get(instance)
            .and_then(|snaps| snaps.get(snapshot))
            .ok_or_else(|| {
                ClientError::NotFound(format!("snapshot {snapshot:?} of instance {instance:?}"))
            })?;

        Ok((snap.clone(), Uuid::new_v4().to_string()))
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_instance(&self, req: InstancesPost) -> Result<Operation> {
        info!("Creating mock instance");

        let name = req.name.clone();
        let instance = Instance {
            name: name.clone(),
            description: req.put.description.clone(),
            type_: req.type_,
            ephemeral: req.put.ephemeral,
            architecture: "x86_64".to_string(),
            profiles: req.put.profiles.clone(),
            config: req.put.config.clone(),
            devices: req.put.devices.clone(),
            ..Default::default()
        };

        self.insert_instance(&name, instance)?;
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, _source, image, req), fields(name = %req.name, fingerprint = %image.fingerprint))]
    async fn create_instance_from_image(
        &self,
        _source: &dyn ImageServer,
        image: &Image,
        req: InstancesPost,
    ) -> Result<Operation> {
        info!("Creating mock instance from image");

        let name = req.name.clone();
        let mut config = req.put.config.clone();
        config.insert(
            "volatile.base_image".to_string(),
            image.fingerprint.clone(),
        );
        config.insert("image.description".to_string(), "mock image".to_string());

        let instance = Instance {
            name: name.clone(),
            description: req.put.description.clone(),
            type_: req.type_,
            ephemeral: req.put.ephemeral,
            architecture: "x86_64".to_string(),
            profiles: req.put.profiles.clone(),
            config,
            devices: req.put.devices.clone(),
            ..Default::default()
        };

        self.insert_instance(&name, instance)?;
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, args), fields(name = %args.name))]
    async fn create_instance_from_backup(&self, args: InstanceBackupArgs) -> Result<Operation> {
        info!(pool = ?args.pool_name, "Restoring mock instance from backup");

        let mut devices = HashMap::new();
        let mut root = HashMap::new();
        root.insert("type".to_string(), "disk".to_string());
        root.insert("path".to_string(), "/".to_string());
        root.insert(
            "pool".to_string(),
            args.pool_name.clone().unwrap_or_else(|| "default".to_string()),
        );
        devices.insert("root".to_string(), root);

        let instance = Instance {
            name: args.name.clone(),
            architecture: "x86_64".to_string(),
            profiles: vec!["default".to_string()],
            devices,
            ..Default::default()
        };

        self.insert_instance(&args.name, instance)?;
        self.state
            .write()
            .unwrap()
            .backup_pools
            .insert(args.name.clone(), args.pool_name);
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, _source, instance, args), fields(name = %args.name, source = %instance.name))]
    async fn copy_instance(
        &self,
        _source: &dyn InstanceServer,
        instance: &Instance,
        args: &InstanceCopyArgs,
    ) -> Result<Operation> {
        info!("Copying mock instance");

        let mut copied = instance.clone();
        copied.status = String::new();
        copied.status_code = StatusCode::Unknown;
        self.insert_instance(&args.name, copied)?;
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, _source, snapshot, args), fields(name = %args.name, snapshot = %snapshot.name))]
    async fn copy_instance_snapshot(
        &self,
        _source: &dyn InstanceServer,
        source_instance: &str,
        snapshot: &InstanceSnapshot,
        args: &InstanceSnapshotCopyArgs,
    ) -> Result<Operation> {
        info!(source = %source_instance, "Copying mock instance snapshot");

        let instance = Instance {
            name: args.name.clone(),
            ephemeral: snapshot.ephemeral,
            stateful: snapshot.stateful,
            architecture: "x86_64".to_string(),
            profiles: snapshot.profiles.clone(),
            config: snapshot.config.clone(),
            devices: snapshot.devices.clone(),
            ..Default::default()
        };

        self.insert_instance(&args.name, instance)?;
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, req), fields(name = %name))]
    async fn update_instance(
        &self,
        name: &str,
        req: InstancePut,
        etag: &str,
    ) -> Result<Operation> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .instances
            .get_mut(name)
            .ok_or_else(|| instance_not_found(name))?;

        if !etag.is_empty() && etag != entry.etag {
            return Err(ClientError::Api(format!(
                "etag mismatch for instance {name:?}"
            )));
        }

        entry.instance.description = req.description;
        entry.instance.ephemeral = req.ephemeral;
        entry.instance.architecture = req.architecture;
        entry.instance.restore = req.restore;
        entry.instance.stateful = req.stateful;
        entry.instance.config = req.config;
        entry.instance.profiles = req.profiles;
        entry.instance.devices = req.devices;
        entry.etag = Uuid::new_v4().to_string();

        debug!("Mock instance updated");
        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self, req), fields(name = %name, action = req.action.as_str(), force = req.force))]
    async fn update_instance_state(
        &self,
        name: &str,
        req: InstanceStatePut,
        etag: &str,
    ) -> Result<Operation> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .instances
            .get_mut(name)
            .ok_or_else(|| instance_not_found(name))?;

        if !etag.is_empty() && etag != entry.etag {
            return Err(ClientError::Api(format!(
                "etag mismatch for instance {name:?}"
            )));
        }

        match req.action {
            StateAction::Start => {
                entry.set_status(StatusCode::Running);
                entry.processes = if entry.agent_ticks > 0 { 0 } else { 1 };
                info!("Mock instance started");
            }
            StateAction::Stop => {
                if entry.instance.ephemeral {
                    // Ephemeral instances vanish on stop.
                    state.instances.remove(name);
                    state.files.remove(name);
                    info!("Mock ephemeral instance removed on stop");
                } else {
                    entry.set_status(StatusCode::Stopped);
                    entry.processes = 0;
                    info!("Mock instance stopped");
                }
            }
        }

        Ok(CompletedOperation::ok())
    }

    #[instrument(skip(self), fields(name = %name))]
    async fn delete_instance(&self, name: &str) -> Result<Operation> {
        let mut state = self.state.write().unwrap();
        if state.instances.remove(name).is_none() {
            return Err(instance_not_found(name));
        }

        state.files.remove(name);
        state.snapshots.remove(name);
        info!("Mock instance deleted");
        Ok(CompletedOperation::ok())
    }

    async fn upload_file(&self, instance: &str, file: FilePayload) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.instances.contains_key(instance) {
            return Err(instance_not_found(instance));
        }

        debug!(instance = %instance, path = %file.target_path, "Mock file upload");
        state
            .files
            .entry(instance.to_string())
            .or_default()
            .insert(file.target_path.clone(), file);
        Ok(())
    }

    async fn delete_file(&self, instance: &str, target_path: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let files = state
            .files
            .get_mut(instance)
            .ok_or_else(|| instance_not_found(instance))?;

        files
            .remove(target_path)
            .ok_or_else(|| ClientError::NotFound(format!("file {target_path:?}")))?;
        Ok(())
    }

    fn is_clustered(&self) -> bool {
        self.clustered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_req(name: &str) -> InstancesPost {
        InstancesPost {
            name: name.to_string(),
            type_: InstanceType::Container,
            source: InstanceSource {
                type_: "none".to_string(),
                ..Default::default()
            },
            put: InstancePut::default(),
        }
    }

    async fn start(server: &MockServer, name: &str) {
        let req = InstanceStatePut {
            action: StateAction::Start,
            force: false,
            timeout_secs: 180,
        };
        let op = server.update_instance_state(name, req, "").await.unwrap();
        op.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let server = MockServer::new();
        let op = server.create_instance(create_req("c1")).await.unwrap();
        op.wait().await.unwrap();

        let (instance, etag) = server.get_instance("c1").await.unwrap();
        assert_eq!(instance.status_code, StatusCode::Stopped);
        assert!(!etag.is_empty());

        start(&server, "c1").await;
        let (state, _) = server.get_instance_state("c1").await.unwrap();
        assert_eq!(state.status_code, StatusCode::Running);
        assert!(state.processes > 0);

        let op = server.delete_instance("c1").await.unwrap();
        op.wait().await.unwrap();
        assert!(!server.has_instance("c1"));
    }

    #[tokio::test]
    async fn test_agent_delay_defers_processes() {
        let server = MockServer::new();
        server
            .create_instance(create_req("vm1"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        server.set_agent_delay("vm1", 2);

        start(&server, "vm1").await;

        let (state, _) = server.get_instance_state("vm1").await.unwrap();
        assert_eq!(state.status_code, StatusCode::Running);
        assert_eq!(state.processes, 0);

        let (state, _) = server.get_instance_state("vm1").await.unwrap();
        assert!(state.processes > 0);
    }

    #[tokio::test]
    async fn test_ephemeral_instance_vanishes_on_stop() {
        let server = MockServer::new();
        let mut req = create_req("eph1");
        req.put.ephemeral = true;
        server.create_instance(req).await.unwrap().wait().await.unwrap();

        start(&server, "eph1").await;

        let stop = InstanceStatePut {
            action: StateAction::Stop,
            force: true,
            timeout_secs: 180,
        };
        let op = server.update_instance_state("eph1", stop, "").await.unwrap();
        op.wait().await.unwrap();

        let err = server.get_instance("eph1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_alias_resolution() {
        let server = MockServer::new();
        server.add_image(Image {
            fingerprint: "abcd1234".to_string(),
            public: false,
            aliases: vec![],
        });
        server.add_alias("debian/12", "abcd1234");

        let alias = server.get_image_alias("debian/12").await.unwrap();
        assert_eq!(alias.target, "abcd1234");

        let image = server.get_image(&alias.target).await.unwrap();
        assert_eq!(image.fingerprint, "abcd1234");

        assert!(server.get_image_alias("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_etag_mismatch_rejected() {
        let server = MockServer::new();
        server
            .create_instance(create_req("c2"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let result = server
            .update_instance("c2", InstancePut::default(), "stale-etag")
            .await;
        assert!(matches!(result, Err(ClientError::Api(_))));
    }

    #[tokio::test]
    async fn test_file_upload_and_delete() {
        let server = MockServer::new();
        server
            .create_instance(create_req("c3"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        let file = FilePayload {
            target_path: "/etc/motd".to_string(),
            content: b"hello".to_vec(),
            mode: Some("0644".to_string()),
            ..Default::default()
        };
        server.upload_file("c3", file).await.unwrap();
        assert!(server.files_of("c3").contains_key("/etc/motd"));

        server.delete_file("c3", "/etc/motd").await.unwrap();
        assert!(server.files_of("c3").is_empty());

        let err = server.delete_file("c3", "/etc/motd").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
