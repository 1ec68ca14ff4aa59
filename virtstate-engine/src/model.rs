//! Declarative instance model.
//!
//! [`InstanceModel`] is the single record the engine consumes and produces:
//! user-declared desired state plus the computed fields re-derived from the
//! live remote object after every mutating operation. Unset and empty carry
//! different meanings for several fields, so optionality is explicit
//! throughout.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use virtstate_client::InstanceType;

use crate::error::EngineError;

/// Config key prefixes managed by the server, never by the user.
pub const COMPUTED_KEY_PREFIXES: &[&str] = &["environment.", "image.", "volatile."];

/// Config key pinning the interface used to resolve the primary address.
pub const ACCESS_INTERFACE_KEY: &str = "user.access_interface";

// =============================================================================
// DEVICES AND FILES
// =============================================================================

/// Device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    None,
    Disk,
    Nic,
    UnixChar,
    UnixBlock,
    Usb,
    Gpu,
    Infiniband,
    Proxy,
    UnixHotplug,
    Tpm,
    Pci,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::None => "none",
            DeviceType::Disk => "disk",
            DeviceType::Nic => "nic",
            DeviceType::UnixChar => "unix-char",
            DeviceType::UnixBlock => "unix-block",
            DeviceType::Usb => "usb",
            DeviceType::Gpu => "gpu",
            DeviceType::Infiniband => "infiniband",
            DeviceType::Proxy => "proxy",
            DeviceType::UnixHotplug => "unix-hotplug",
            DeviceType::Tpm => "tpm",
            DeviceType::Pci => "pci",
        }
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(DeviceType::None),
            "disk" => Ok(DeviceType::Disk),
            "nic" => Ok(DeviceType::Nic),
            "unix-char" => Ok(DeviceType::UnixChar),
            "unix-block" => Ok(DeviceType::UnixBlock),
            "usb" => Ok(DeviceType::Usb),
            "gpu" => Ok(DeviceType::Gpu),
            "infiniband" => Ok(DeviceType::Infiniband),
            "proxy" => Ok(DeviceType::Proxy),
            "unix-hotplug" => Ok(DeviceType::UnixHotplug),
            "tpm" => Ok(DeviceType::Tpm),
            "pci" => Ok(DeviceType::Pci),
            other => Err(format!("unknown device type {other:?}")),
        }
    }
}

/// One named device attached to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: DeviceType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// One file pushed into an instance.
///
/// Exactly one of `content` and `source_path` is set; `append` defaults to
/// false and exists to round-trip the server's file model losslessly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub source_path: Option<String>,
    pub target_path: String,
    #[serde(default)]
    pub uid: Option<i64>,
    #[serde(default)]
    pub gid: Option<i64>,
    /// Octal mode string, e.g. "0644".
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub create_directories: bool,
    #[serde(default)]
    pub append: bool,
}

// =============================================================================
// PROFILES
// =============================================================================

/// Tri-state profile list.
///
/// Unset means the implicit `["default"]` profile; an explicit empty list
/// means no profiles at all. The two must not be collapsed before the
/// decision point, so the wrapper keeps them distinct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileSpec(pub Option<Vec<String>>);

impl ProfileSpec {
    /// The user did not mention profiles at all.
    pub fn unset() -> Self {
        Self(None)
    }

    /// The user declared this exact list (possibly empty).
    pub fn explicit(profiles: Vec<String>) -> Self {
        Self(Some(profiles))
    }

    pub fn is_unset(&self) -> bool {
        self.0.is_none()
    }

    /// Profiles to apply: unset resolves to `["default"]`.
    pub fn effective(&self) -> Vec<String> {
        match &self.0 {
            None => vec!["default".to_string()],
            Some(profiles) => profiles.clone(),
        }
    }
}

// =============================================================================
// CREATION SOURCE
// =============================================================================

/// Reference to an image, optionally qualified with a remote name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub remote: Option<String>,
    pub name: String,
}

impl ImageRef {
    /// Parse `"remote:alias-or-fingerprint"`, splitting on the first colon.
    pub fn parse(image: &str) -> Self {
        match image.split_once(':') {
            Some((remote, name)) => Self {
                remote: Some(remote.to_string()),
                name: name.to_string(),
            },
            None => Self {
                remote: None,
                name: image.to_string(),
            },
        }
    }
}

/// Source an instance is created from, fixed at validation time.
///
/// Exactly one variant applies; mutual exclusion of the underlying model
/// fields is enforced before this is constructed, so the dispatcher can
/// match exhaustively without re-checking.
#[derive(Debug, Clone, PartialEq)]
pub enum CreationSource {
    /// Initialize from an image.
    Image(ImageRef),
    /// Restore from a backup archive, optionally steered into a pool.
    BackupFile { path: String, pool: Option<String> },
    /// Copy an existing instance or one of its snapshots.
    Copy(SourceInstance),
    /// No source: an empty shell that cannot be running.
    Empty,
}

/// Reference to a source instance for copy creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInstance {
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<String>,
}

// =============================================================================
// INSTANCE MODEL
// =============================================================================

/// The declarative plus observed record for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceModel {
    /// Instance name. Immutable.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Instance kind. Immutable; defaults to container.
    #[serde(rename = "type", default)]
    pub type_: Option<InstanceType>,
    /// Image reference, mutually exclusive with the other sources. Immutable.
    #[serde(default)]
    pub image: Option<String>,
    /// Immutable; defaults to false.
    #[serde(default)]
    pub ephemeral: Option<bool>,
    /// Defaults to true.
    #[serde(default)]
    pub running: Option<bool>,
    /// Defaults to true.
    #[serde(default)]
    pub wait_for_network: Option<bool>,
    #[serde(default)]
    pub profiles: ProfileSpec,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    /// User-declared configuration subset only; server-managed keys are
    /// stripped on read and merged back on write.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Immutable.
    #[serde(default)]
    pub project: Option<String>,
    /// Immutable.
    #[serde(default)]
    pub remote: Option<String>,
    /// Node placement; replaces the instance when changed by the user.
    #[serde(default)]
    pub target: Option<String>,
    /// Immutable.
    #[serde(default)]
    pub source_instance: Option<SourceInstance>,
    /// Path to a backup archive. Immutable.
    #[serde(default)]
    pub source_file: Option<String>,

    // Computed.
    #[serde(default)]
    pub ipv4_address: Option<String>,
    #[serde(default)]
    pub ipv6_address: Option<String>,
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

impl InstanceModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn running(&self) -> bool {
        self.running.unwrap_or(true)
    }

    pub fn ephemeral(&self) -> bool {
        self.ephemeral.unwrap_or(false)
    }

    pub fn wait_for_network(&self) -> bool {
        self.wait_for_network.unwrap_or(true)
    }

    pub fn instance_type(&self) -> InstanceType {
        self.type_.unwrap_or_default()
    }

    /// Prefixes of config keys the server computes.
    pub fn computed_keys(&self) -> &'static [&'static str] {
        COMPUTED_KEY_PREFIXES
    }
}

// =============================================================================
// IMPORT
// =============================================================================

/// Parsed import identifier: `[remote:][project/]name[,image=<ref>]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportRequest {
    pub remote: Option<String>,
    pub project: Option<String>,
    pub name: String,
    pub image: Option<String>,
}

impl ImportRequest {
    pub fn parse(id: &str) -> Result<Self, EngineError> {
        let mut parts = id.split(',');
        let address = parts.next().unwrap_or_default();

        let (remote, rest) = match address.split_once(':') {
            Some((remote, rest)) => (Some(remote.to_string()), rest),
            None => (None, address),
        };

        let (project, name) = match rest.split_once('/') {
            Some((project, name)) => (Some(project.to_string()), name),
            None => (None, rest),
        };

        if name.is_empty() {
            return Err(EngineError::validation(
                "Invalid import ID",
                format!("import ID {id:?} is missing the required instance name"),
            ));
        }

        let mut request = ImportRequest {
            remote,
            project,
            name: name.to_string(),
            image: None,
        };

        for option in parts {
            match option.split_once('=') {
                Some(("image", value)) if !value.is_empty() => {
                    request.image = Some(value.to_string());
                }
                _ => {
                    return Err(EngineError::validation(
                        "Invalid import ID",
                        format!("unsupported import option {option:?}; allowed options: image"),
                    ));
                }
            }
        }

        Ok(request)
    }
}
