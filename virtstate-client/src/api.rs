//! Wire types for the hypervisor management API.
//!
//! These mirror the JSON objects exposed by an Incus-style server. Only the
//! fields the engine consumes are modeled; unknown fields are ignored on
//! deserialization.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque version token used for optimistic-concurrency updates.
pub type Etag = String;

// =============================================================================
// INSTANCE OBJECTS
// =============================================================================

/// Instance kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    Container,
    VirtualMachine,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Container => "container",
            InstanceType::VirtualMachine => "virtual-machine",
        }
    }
}

impl Default for InstanceType {
    fn default() -> Self {
        Self::Container
    }
}

/// Coarse status code reported for instances and operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Starting,
    Started,
    Stopping,
    Stopped,
    Running,
    Ready,
    Freezing,
    Frozen,
    Thawed,
    Aborting,
    Error,
    Unknown,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Starting => "Starting",
            StatusCode::Started => "Started",
            StatusCode::Stopping => "Stopping",
            StatusCode::Stopped => "Stopped",
            StatusCode::Running => "Running",
            StatusCode::Ready => "Ready",
            StatusCode::Freezing => "Freezing",
            StatusCode::Frozen => "Frozen",
            StatusCode::Thawed => "Thawed",
            StatusCode::Aborting => "Aborting",
            StatusCode::Error => "Error",
            StatusCode::Unknown => "Unknown",
        }
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full instance object as reported by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name (unique per project).
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Instance kind.
    #[serde(rename = "type", default)]
    pub type_: InstanceType,
    /// Human-readable status ("Running", "Stopped", ...).
    #[serde(default)]
    pub status: String,
    /// Machine-readable status.
    #[serde(default)]
    pub status_code: StatusCode,
    /// Cluster member hosting the instance ("none" when not clustered).
    #[serde(default)]
    pub location: String,
    /// Whether the instance is destroyed on stop.
    #[serde(default)]
    pub ephemeral: bool,
    /// Whether runtime state is preserved across stop/start.
    #[serde(default)]
    pub stateful: bool,
    /// Snapshot a stopped instance should be restored from, if any.
    #[serde(default)]
    pub restore: Option<String>,
    /// CPU architecture.
    #[serde(default)]
    pub architecture: String,
    /// Applied profiles, in order.
    #[serde(default)]
    pub profiles: Vec<String>,
    /// Configuration map, including server-managed keys.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// Devices, keyed by device name. The inner map carries a "type" key.
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    /// Creation timestamp.
    #[serde(default)]
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Mutable subset of an instance, used for updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancePut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub restore: Option<String>,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
}

/// Creation source for a new instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSource {
    /// Source type: "image", "copy" or "none".
    #[serde(rename = "type")]
    pub type_: String,
    /// Image alias, when creating from an image.
    #[serde(default)]
    pub alias: Option<String>,
    /// Image fingerprint, when creating from an image.
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Instance creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstancesPost {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_: InstanceType,
    #[serde(default)]
    pub source: InstanceSource,
    #[serde(flatten)]
    pub put: InstancePut,
}

/// Instance snapshot object, as used for snapshot copies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
}

// =============================================================================
// RUNTIME STATE
// =============================================================================

/// Address family of a reported address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Inet => "inet",
            AddressFamily::Inet6 => "inet6",
        }
    }
}

/// Scope of a reported address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressScope {
    Global,
    Link,
    Local,
}

impl AddressScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressScope::Global => "global",
            AddressScope::Link => "link",
            AddressScope::Local => "local",
        }
    }
}

/// One address on one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub family: AddressFamily,
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    pub scope: AddressScope,
}

/// Network state of one guest interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStateNetwork {
    /// Addresses currently bound to the interface.
    #[serde(default)]
    pub addresses: Vec<NetworkAddress>,
    /// Link-layer address, empty when not applicable.
    #[serde(default)]
    pub hwaddr: String,
    /// Host-side interface name, empty for purely virtual interfaces.
    #[serde(default)]
    pub host_name: String,
    #[serde(default)]
    pub mtu: i64,
    /// Link state ("up"/"down").
    #[serde(default)]
    pub state: String,
}

/// Runtime state of an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: StatusCode,
    /// Guest process count. Positive only once the in-guest agent has
    /// attached, which for virtual machines lags the outer "Running".
    #[serde(default)]
    pub processes: i64,
    /// Network state keyed by guest interface name.
    #[serde(default)]
    pub network: HashMap<String, InstanceStateNetwork>,
}

/// Requested state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateAction {
    Start,
    Stop,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
        }
    }
}

/// State transition request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatePut {
    pub action: StateAction,
    /// Force the transition instead of signalling the guest.
    #[serde(default)]
    pub force: bool,
    /// Server-side timeout for the transition, in seconds.
    pub timeout_secs: i64,
}

// =============================================================================
// IMAGES AND CONNECTIONS
// =============================================================================

/// An alias pointing at an image fingerprint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageAlias {
    pub name: String,
    /// Fingerprint the alias resolves to.
    #[serde(default)]
    pub target: String,
}

/// Image metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Image {
    pub fingerprint: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub aliases: Vec<ImageAlias>,
}

/// Connection details for a server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Wire protocol: "incus" for native servers, anything else for
    /// public/simple image servers.
    pub protocol: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

// =============================================================================
// CALL ARGUMENTS
// =============================================================================

/// Arguments for restoring an instance from a backup archive.
#[derive(Debug, Clone)]
pub struct InstanceBackupArgs {
    /// Name for the new instance.
    pub name: String,
    /// Destination storage pool override, if any.
    pub pool_name: Option<String>,
    /// Path to the backup archive on the local filesystem.
    pub backup_file: PathBuf,
}

/// Arguments for copying an instance.
#[derive(Debug, Clone)]
pub struct InstanceCopyArgs {
    pub name: String,
    pub live: bool,
    pub instance_only: bool,
    pub refresh: bool,
    pub allow_inconsistent: bool,
}

/// Arguments for copying an instance snapshot.
#[derive(Debug, Clone)]
pub struct InstanceSnapshotCopyArgs {
    pub name: String,
    pub live: bool,
}

/// A file pushed into an instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilePayload {
    pub target_path: String,
    pub content: Vec<u8>,
    pub uid: Option<i64>,
    pub gid: Option<i64>,
    /// Octal mode string, e.g. "0644".
    pub mode: Option<String>,
    pub create_directories: bool,
    pub append: bool,
}
