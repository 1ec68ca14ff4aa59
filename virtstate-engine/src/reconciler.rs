//! Instance reconciliation.
//!
//! [`InstanceReconciler`] drives the full lifecycle of one instance against
//! a registered remote: create (dispatching over the creation source),
//! read, update, delete, plus the state sync that re-derives the model from
//! the live remote object after every mutation. The model is never trusted
//! after a mutating call returns; the remote is canonical.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use virtstate_client::{
    Image, InstanceBackupArgs, InstanceCopyArgs, InstancePut, InstanceServer,
    InstanceSnapshotCopyArgs, InstanceSource, InstancesPost,
};
use virtstate_common::Deadline;

use crate::convert::{
    backup_file_path, copyable_config, devices_to_wire, file_payload, merge_config,
    merge_device_maps, model_from_remote,
};
use crate::error::{Diagnostics, EngineError, Result};
use crate::lifecycle::{is_instance_running, start_instance, stop_instance, wait_instance_network};
use crate::model::{
    CreationSource, FileSpec, ImageRef, ImportRequest, InstanceModel, SourceInstance,
    ACCESS_INTERFACE_KEY,
};
use crate::network::{find_addresses, get_addresses};
use crate::provider::Provider;
use crate::validate::{validate, validate_update};

/// Native wire protocol; anything else is a public/simple image server.
const NATIVE_PROTOCOL: &str = "incus";

/// Reconciles declared instance models against their remotes.
pub struct InstanceReconciler {
    provider: Arc<Provider>,
}

impl InstanceReconciler {
    pub fn new(provider: Arc<Provider>) -> Self {
        Self { provider }
    }

    /// Create the instance described by `model` and converge its state.
    ///
    /// Validates, dispatches over the creation source, then starts the
    /// instance and pushes declared files when `running` asks for it. The
    /// model is re-derived from the remote before returning.
    #[instrument(skip(self, model, deadline), fields(name = %model.name))]
    pub async fn create(&self, model: &mut InstanceModel, deadline: Deadline) -> Result<()> {
        let source = validate(model)?;
        let server = self
            .provider
            .instance_server(model.remote.as_deref(), model.project.as_deref())?;

        info!("Creating instance");
        match source {
            CreationSource::Image(image) => {
                self.create_from_image(&*server, model, &image, deadline)
                    .await?
            }
            CreationSource::BackupFile { path, pool } => {
                let backup_file = backup_file_path(&path)?;
                let args = InstanceBackupArgs {
                    name: model.name.clone(),
                    pool_name: pool,
                    backup_file,
                };
                let op = server
                    .create_instance_from_backup(args)
                    .await
                    .map_err(|e| EngineError::remote(&model.name, "restore", e))?;
                op.wait_deadline(deadline)
                    .await
                    .map_err(|e| EngineError::remote(&model.name, "restore", e))?;
            }
            CreationSource::Copy(source) => {
                self.create_from_copy(&*server, model, &source, deadline)
                    .await?
            }
            CreationSource::Empty => {
                let mut req = creation_request(model);
                req.source = InstanceSource {
                    type_: "none".to_string(),
                    ..Default::default()
                };
                let op = server
                    .create_instance(req)
                    .await
                    .map_err(|e| EngineError::remote(&model.name, "create", e))?;
                op.wait_deadline(deadline)
                    .await
                    .map_err(|e| EngineError::remote(&model.name, "create", e))?;
            }
        }

        if model.running() {
            let config = self.provider.poll_config();
            let started = start_instance(&*server, &model.name, &config, deadline).await?;
            if started && model.wait_for_network() {
                wait_instance_network(&*server, &model.name, &config, deadline).await?;
            }
            self.push_files(&*server, &model.name, &model.files).await?;
        }

        if !self.sync_state(model).await? {
            return Err(EngineError::NotFound {
                instance: model.name.clone(),
            });
        }
        Ok(())
    }

    /// Refresh the model from the remote.
    ///
    /// Returns false when the instance no longer exists; the caller drops
    /// it from tracked state instead of treating that as a failure.
    pub async fn read(&self, model: &mut InstanceModel) -> Result<bool> {
        self.sync_state(model).await
    }

    /// Apply in-place changes and converge the running state.
    ///
    /// `prior_files` is the previously applied file set, used to compute
    /// which files to delete, push or replace.
    #[instrument(skip(self, model, prior_files, deadline), fields(name = %model.name))]
    pub async fn update(
        &self,
        model: &mut InstanceModel,
        prior_files: &[FileSpec],
        deadline: Deadline,
    ) -> Result<()> {
        validate_update(model)?;
        let server = self
            .provider
            .instance_server(model.remote.as_deref(), model.project.as_deref())?;
        let name = model.name.clone();

        let (remote, etag) = server
            .get_instance(&name)
            .await
            .map_err(|e| EngineError::remote(&name, "fetch", e))?;

        // Fields the model does not manage are carried over from the remote
        // so the replace-style PUT does not reset them.
        let req = InstancePut {
            description: model.description.clone().unwrap_or_default(),
            ephemeral: model.ephemeral(),
            architecture: remote.architecture.clone(),
            restore: remote.restore.clone(),
            stateful: remote.stateful,
            config: merge_config(&remote.config, &model.config, model.computed_keys()),
            profiles: model.profiles.effective(),
            devices: devices_to_wire(&model.devices),
        };

        debug!("Updating instance");
        let op = server
            .update_instance(&name, req, &etag)
            .await
            .map_err(|e| EngineError::remote(&name, "update", e))?;
        op.wait_deadline(deadline)
            .await
            .map_err(|e| EngineError::remote(&name, "update", e))?;

        let config = self.provider.poll_config();
        if model.running() {
            // A fresh start is the only case worth waiting for an address on;
            // an instance that was already operational keeps the one it has.
            let started = start_instance(&*server, &name, &config, deadline).await?;
            if started && model.wait_for_network() {
                wait_instance_network(&*server, &name, &config, deadline).await?;
            }
            self.diff_files(&*server, &name, prior_files, &model.files)
                .await?;
        } else {
            stop_instance(&*server, &name, false, &config, deadline).await?;
        }

        if !self.sync_state(model).await? {
            return Err(EngineError::NotFound { instance: name });
        }
        Ok(())
    }

    /// Stop and delete the instance.
    ///
    /// An instance already gone (out of band, or ephemeral and removed on
    /// stop) is deletion success.
    #[instrument(skip(self, model, deadline), fields(name = %model.name))]
    pub async fn delete(&self, model: &InstanceModel, deadline: Deadline) -> Result<()> {
        let server = self
            .provider
            .instance_server(model.remote.as_deref(), model.project.as_deref())?;
        let config = self.provider.poll_config();

        let found = stop_instance(&*server, &model.name, true, &config, deadline).await?;
        if !found {
            info!("Instance already gone");
            return Ok(());
        }

        info!("Deleting instance");
        let op = match server.delete_instance(&model.name).await {
            Ok(op) => op,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(EngineError::remote(&model.name, "delete", e)),
        };
        match op.wait_deadline(deadline).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(EngineError::remote(&model.name, "delete", e)),
        }
    }

    /// Build a model for an externally created instance.
    ///
    /// `id` has the form `[remote:][project/]name[,image=<ref>]`; the image
    /// qualifier seeds the immutable image attribute state cannot recover.
    pub async fn import(&self, id: &str) -> Result<InstanceModel> {
        let request = ImportRequest::parse(id)?;
        let mut model = InstanceModel::new(&request.name);
        model.remote = request.remote;
        model.project = request.project;
        model.image = request.image;

        if !self.sync_state(&mut model).await? {
            return Err(EngineError::NotFound {
                instance: request.name,
            });
        }
        Ok(model)
    }

    /// Re-derive the model from the live remote object.
    ///
    /// Returns false when the instance no longer exists. Every mutating
    /// operation ends here so the persisted state is what the remote
    /// reports, not what the plan asked for.
    #[instrument(skip(self, model), fields(name = %model.name))]
    pub async fn sync_state(&self, model: &mut InstanceModel) -> Result<bool> {
        let server = self
            .provider
            .instance_server(model.remote.as_deref(), model.project.as_deref())?;

        let (remote, _etag) = match server.get_instance(&model.name).await {
            Ok(fetched) => fetched,
            Err(e) if e.is_not_found() => {
                warn!("Instance no longer exists");
                return Ok(false);
            }
            Err(e) => return Err(EngineError::remote(&model.name, "fetch", e)),
        };
        let (state, _) = server
            .get_instance_state(&model.name)
            .await
            .map_err(|e| EngineError::remote(&model.name, "fetch state of", e))?;

        // Unresolved pieces stay null rather than empty.
        model.ipv4_address = None;
        model.ipv6_address = None;
        model.mac_address = None;
        let identity = match remote.config.get(ACCESS_INTERFACE_KEY) {
            Some(iface) => state.network.get(iface).map(|net| get_addresses(iface, net)),
            None => find_addresses(&state.network),
        };
        if let Some(identity) = identity {
            model.ipv4_address = identity.ipv4;
            model.ipv6_address = identity.ipv6;
            model.mac_address = identity.mac;
        }

        model_from_remote(model, &remote)?;

        // Drift in the runtime state (a manual stop) must show on the next
        // plan, so running comes from the runtime status.
        model.running = Some(is_instance_running(&state));

        model.target = if server.is_clustered() || remote.location != "none" {
            Some(remote.location.clone())
        } else {
            None
        };

        // Models persisted before the attribute existed default to waiting.
        if model.wait_for_network.is_none() {
            model.wait_for_network = Some(true);
        }

        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Creation variants
    // -------------------------------------------------------------------------

    async fn create_from_image(
        &self,
        server: &dyn InstanceServer,
        model: &InstanceModel,
        image: &ImageRef,
        deadline: Deadline,
    ) -> Result<()> {
        let image_remote = image.remote.as_deref().or(model.remote.as_deref());
        let image_server = self.provider.image_server(image_remote)?;

        let mut req = creation_request(model);
        req.source = InstanceSource {
            type_: "image".to_string(),
            ..Default::default()
        };

        let info = if image_server.connection_info().protocol != NATIVE_PROTOCOL {
            // Simple image servers have no alias API; the raw reference is
            // passed through untouched.
            req.source.alias = Some(image.name.clone());
            Image {
                fingerprint: image.name.clone(),
                public: true,
                aliases: vec![],
            }
        } else {
            let fingerprint = match image_server.get_image_alias(&image.name).await {
                Ok(alias) => alias.target,
                // Not an alias; treat the reference as a fingerprint.
                Err(e) if e.is_not_found() => image.name.clone(),
                Err(e) => return Err(EngineError::remote(&model.name, "resolve image for", e)),
            };
            req.source.fingerprint = Some(fingerprint.clone());
            image_server
                .get_image(&fingerprint)
                .await
                .map_err(|e| EngineError::remote(&model.name, "fetch image for", e))?
        };

        let op = server
            .create_instance_from_image(&*image_server, &info, req)
            .await
            .map_err(|e| EngineError::remote(&model.name, "create", e))?;
        op.wait_deadline(deadline)
            .await
            .map_err(|e| EngineError::remote(&model.name, "create", e))
    }

    async fn create_from_copy(
        &self,
        server: &dyn InstanceServer,
        model: &InstanceModel,
        source: &SourceInstance,
        deadline: Deadline,
    ) -> Result<()> {
        // The source is looked up in its own project; a copy is always
        // treated as crossing hosts, so host-specific volatile keys (idmap
        // state) never travel with it.
        let source_project = (!source.project.is_empty()).then_some(source.project.as_str());
        let source_server = self
            .provider
            .instance_server(model.remote.as_deref(), source_project)?;
        let remote_copy = true;

        let user_config: HashMap<String, String> = model
            .config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let user_devices = devices_to_wire(&model.devices);

        let op = if let Some(snapshot) = &source.snapshot {
            let (mut snap, _etag) = source_server
                .get_instance_snapshot(&source.name, snapshot)
                .await
                .map_err(|e| EngineError::remote(&model.name, "fetch copy source for", e))?;

            // The plan's profile set replaces the source's wholesale; an
            // unset plan means the default profile, not the source's list.
            snap.profiles = model.profiles.effective();
            let mut config = copyable_config(&snap.config, remote_copy);
            config.extend(user_config);
            snap.config = config;
            snap.devices = merge_device_maps(&snap.devices, &user_devices);

            let args = InstanceSnapshotCopyArgs {
                name: model.name.clone(),
                live: true,
            };
            server
                .copy_instance_snapshot(&*source_server, &source.name, &snap, &args)
                .await
        } else {
            let (mut instance, _etag) = source_server
                .get_instance(&source.name)
                .await
                .map_err(|e| EngineError::remote(&model.name, "fetch copy source for", e))?;

            instance.profiles = model.profiles.effective();
            let mut config = copyable_config(&instance.config, remote_copy);
            config.extend(user_config);
            instance.config = config;
            instance.devices = merge_device_maps(&instance.devices, &user_devices);

            let args = InstanceCopyArgs {
                name: model.name.clone(),
                live: true,
                instance_only: false,
                refresh: false,
                allow_inconsistent: false,
            };
            server.copy_instance(&*source_server, &instance, &args).await
        };

        let op = op.map_err(|e| EngineError::remote(&model.name, "copy", e))?;
        op.wait_deadline(deadline)
            .await
            .map_err(|e| EngineError::remote(&model.name, "copy", e))
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    async fn push_files(
        &self,
        server: &dyn InstanceServer,
        name: &str,
        files: &[FileSpec],
    ) -> Result<()> {
        let mut diags = Diagnostics::new();
        for file in files {
            if let Err(e) = self.push_file(server, name, file).await {
                diags.add_error(
                    format!("Failed to push file to instance {name:?}"),
                    e.to_string(),
                );
            }
        }
        diags.into_result()
    }

    async fn push_file(
        &self,
        server: &dyn InstanceServer,
        name: &str,
        file: &FileSpec,
    ) -> Result<()> {
        debug!(instance = %name, path = %file.target_path, "Pushing file");
        let payload = file_payload(file)?;
        server
            .upload_file(name, payload)
            .await
            .map_err(|e| EngineError::remote(name, "push file to", e))
    }

    /// Delete removed files, push new or changed ones. Problems accumulate
    /// so one bad file does not hide the rest.
    async fn diff_files(
        &self,
        server: &dyn InstanceServer,
        name: &str,
        prior: &[FileSpec],
        current: &[FileSpec],
    ) -> Result<()> {
        let mut diags = Diagnostics::new();

        for old in prior {
            if !current.iter().any(|f| f.target_path == old.target_path) {
                debug!(instance = %name, path = %old.target_path, "Removing file");
                if let Err(e) = server.delete_file(name, &old.target_path).await {
                    if !e.is_not_found() {
                        diags.add_error(
                            format!("Failed to delete file from instance {name:?}"),
                            e.to_string(),
                        );
                    }
                }
            }
        }

        for file in current {
            let unchanged = prior.iter().any(|f| f == file);
            if unchanged {
                continue;
            }
            if let Err(e) = self.push_file(server, name, file).await {
                diags.add_error(
                    format!("Failed to push file to instance {name:?}"),
                    e.to_string(),
                );
            }
        }

        diags.into_result()
    }
}

/// Base creation request shared by all variants; the source is filled in by
/// the caller.
fn creation_request(model: &InstanceModel) -> InstancesPost {
    InstancesPost {
        name: model.name.clone(),
        type_: model.instance_type(),
        source: InstanceSource::default(),
        put: InstancePut {
            description: model.description.clone().unwrap_or_default(),
            ephemeral: model.ephemeral(),
            profiles: model.profiles.effective(),
            config: model
                .config
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            devices: devices_to_wire(&model.devices),
            ..Default::default()
        },
    }
}
