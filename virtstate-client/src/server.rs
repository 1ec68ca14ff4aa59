//! Server traits implemented by hypervisor backends.
//!
//! [`InstanceServer`] is the contract the engine programs against. Mutating
//! calls return a [`RemoteOperation`] handle that must be awaited before the
//! remote object can be trusted; completion may itself carry an error.

use async_trait::async_trait;
use virtstate_common::Deadline;

use crate::api::*;
use crate::error::{ClientError, Result};

/// Handle for an asynchronous server-side operation.
#[async_trait]
pub trait RemoteOperation: Send + Sync {
    /// Wait for the operation to complete, surfacing its error if it failed.
    async fn wait(&self) -> Result<()>;

    /// Wait, but give up once `deadline` passes.
    async fn wait_deadline(&self, deadline: Deadline) -> Result<()> {
        if deadline.expired() {
            return Err(ClientError::OperationFailed(
                "deadline expired before operation completed".into(),
            ));
        }
        self.wait().await
    }
}

/// Boxed operation handle returned by mutating calls.
pub type Operation = Box<dyn RemoteOperation>;

/// An operation that has already completed with a known result.
///
/// Backends that apply mutations synchronously (the mock, or a future
/// blocking transport) wrap their outcome in this.
pub struct CompletedOperation {
    result: Result<()>,
}

impl CompletedOperation {
    pub fn ok() -> Operation {
        Box::new(Self { result: Ok(()) })
    }

    pub fn err(error: ClientError) -> Operation {
        Box::new(Self { result: Err(error) })
    }
}

#[async_trait]
impl RemoteOperation for CompletedOperation {
    async fn wait(&self) -> Result<()> {
        self.result.clone()
    }
}

/// Read-only image surface of a server.
///
/// Public image servers implement only this; full instance servers
/// implement it as part of [`InstanceServer`].
#[async_trait]
pub trait ImageServer: Send + Sync {
    /// Connection details, including the wire protocol.
    fn connection_info(&self) -> ConnectionInfo;

    /// Resolve an alias to image metadata.
    async fn get_image_alias(&self, name: &str) -> Result<ImageAlias>;

    /// Fetch image metadata by fingerprint.
    async fn get_image(&self, fingerprint: &str) -> Result<Image>;
}

/// Full instance lifecycle surface of a server.
#[async_trait]
pub trait InstanceServer: ImageServer {
    async fn get_instance(&self, name: &str) -> Result<(Instance, Etag)>;

    async fn get_instance_state(&self, name: &str) -> Result<(InstanceState, Etag)>;

    async fn get_instance_snapshot(
        &self,
        instance: &str,
        snapshot: &str,
    ) -> Result<(InstanceSnapshot, Etag)>;

    /// Create an instance with the source already embedded in the request.
    async fn create_instance(&self, req: InstancesPost) -> Result<Operation>;

    /// Create an instance from an image hosted on `source`.
    async fn create_instance_from_image(
        &self,
        source: &dyn ImageServer,
        image: &Image,
        req: InstancesPost,
    ) -> Result<Operation>;

    /// Restore an instance from a backup archive.
    async fn create_instance_from_backup(&self, args: InstanceBackupArgs) -> Result<Operation>;

    /// Copy an instance from `source`.
    async fn copy_instance(
        &self,
        source: &dyn InstanceServer,
        instance: &Instance,
        args: &InstanceCopyArgs,
    ) -> Result<Operation>;

    /// Copy a snapshot of an instance from `source`.
    async fn copy_instance_snapshot(
        &self,
        source: &dyn InstanceServer,
        source_instance: &str,
        snapshot: &InstanceSnapshot,
        args: &InstanceSnapshotCopyArgs,
    ) -> Result<Operation>;

    /// Replace the mutable subset of an instance. `etag` must match the
    /// token returned by the preceding fetch; an empty etag skips the check.
    async fn update_instance(&self, name: &str, req: InstancePut, etag: &str)
        -> Result<Operation>;

    /// Request a state transition (start/stop).
    async fn update_instance_state(
        &self,
        name: &str,
        req: InstanceStatePut,
        etag: &str,
    ) -> Result<Operation>;

    async fn delete_instance(&self, name: &str) -> Result<Operation>;

    /// Push a file into a running instance.
    async fn upload_file(&self, instance: &str, file: FilePayload) -> Result<()>;

    /// Delete a file from a running instance.
    async fn delete_file(&self, instance: &str, target_path: &str) -> Result<()>;

    /// Whether the server is part of a cluster.
    fn is_clustered(&self) -> bool;
}
