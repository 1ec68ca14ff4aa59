//! Conversions between the declarative model and the wire types.
//!
//! The server reports config maps that mix user keys with server-managed
//! ("computed") keys, and devices as nested string maps. These helpers merge
//! and strip configs deterministically and convert device and file specs
//! both ways; round-trips are lossless for anything the model can express.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use virtstate_client::FilePayload;

use crate::error::{EngineError, Result};
use crate::model::{DeviceSpec, FileSpec, InstanceModel};

/// Merge the user config over the remote one for an update.
///
/// Computed keys are taken from the remote map untouched. Every other key
/// comes from the user map alone, so a key the user removed disappears even
/// if the remote still reports it.
pub fn merge_config(
    remote: &HashMap<String, String>,
    user: &BTreeMap<String, String>,
    computed_prefixes: &[&str],
) -> HashMap<String, String> {
    let mut merged: HashMap<String, String> = remote
        .iter()
        .filter(|(key, _)| is_computed(key, computed_prefixes))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Reduce a remote config to the user-declared subset for a read-back.
///
/// Keeps a key when the user previously declared it, or when it is not
/// computed (a key added out of band still surfaces as drift).
pub fn strip_config(
    remote: &HashMap<String, String>,
    prior_declared: &BTreeMap<String, String>,
    computed_prefixes: &[&str],
) -> BTreeMap<String, String> {
    remote
        .iter()
        .filter(|(key, _)| {
            prior_declared.contains_key(*key) || !is_computed(key, computed_prefixes)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn is_computed(key: &str, computed_prefixes: &[&str]) -> bool {
    computed_prefixes.iter().any(|p| key.starts_with(p))
}

/// Filter a source instance's config for a copy.
///
/// `volatile.base_image` always carries over; the idmap snapshot only
/// survives same-host copies; every other volatile key is host-specific and
/// dropped.
pub fn copyable_config(
    config: &HashMap<String, String>,
    remote_copy: bool,
) -> HashMap<String, String> {
    config
        .iter()
        .filter(|(key, _)| match key.as_str() {
            "volatile.base_image" => true,
            "volatile.last_state.idmap" => !remote_copy,
            key => !key.starts_with("volatile."),
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

// =============================================================================
// DEVICES
// =============================================================================

/// Convert declared devices to the wire map, folding the type into the
/// property map under the "type" key.
pub fn devices_to_wire(devices: &[DeviceSpec]) -> HashMap<String, HashMap<String, String>> {
    devices
        .iter()
        .map(|device| {
            let mut properties: HashMap<String, String> = device
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            properties.insert("type".to_string(), device.type_.as_str().to_string());
            (device.name.clone(), properties)
        })
        .collect()
}

/// Convert a wire device map back to declared devices, sorted by name so
/// read-backs are stable.
pub fn devices_from_wire(
    devices: &HashMap<String, HashMap<String, String>>,
) -> Result<Vec<DeviceSpec>> {
    let mut specs = Vec::with_capacity(devices.len());
    for (name, properties) in devices {
        let type_str = properties.get("type").ok_or_else(|| {
            EngineError::validation(
                format!("Invalid device {name:?}"),
                "the server reported a device without a type",
            )
        })?;
        let type_ = type_str.parse().map_err(|detail: String| {
            EngineError::validation(format!("Invalid device {name:?}"), detail)
        })?;
        let properties = properties
            .iter()
            .filter(|(key, _)| key.as_str() != "type")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        specs.push(DeviceSpec {
            name: name.clone(),
            type_,
            properties,
        });
    }
    specs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(specs)
}

/// Overlay one wire device map on another, the overlay winning per name.
pub fn merge_device_maps(
    base: &HashMap<String, HashMap<String, String>>,
    overlay: &HashMap<String, HashMap<String, String>>,
) -> HashMap<String, HashMap<String, String>> {
    let mut merged = base.clone();
    for (name, properties) in overlay {
        merged.insert(name.clone(), properties.clone());
    }
    merged
}

// =============================================================================
// FILES AND PATHS
// =============================================================================

/// Expand a leading `~` or `~/` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~") {
        if rest.is_empty() || rest.starts_with('/') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
    }
    PathBuf::from(path)
}

/// Build the upload payload for one declared file.
///
/// Inline content is taken verbatim; a source_path is read from the local
/// filesystem after home expansion.
pub fn file_payload(file: &FileSpec) -> Result<FilePayload> {
    let content = match (&file.content, &file.source_path) {
        (Some(content), _) => content.clone().into_bytes(),
        (None, Some(source_path)) => {
            let path = expand_home(source_path);
            std::fs::read(&path).map_err(|source| EngineError::LocalFile {
                path: path.display().to_string(),
                source,
            })?
        }
        // Ruled out by validation.
        (None, None) => Vec::new(),
    };
    Ok(FilePayload {
        target_path: file.target_path.clone(),
        content,
        uid: file.uid,
        gid: file.gid,
        mode: file.mode.clone(),
        create_directories: file.create_directories,
        append: file.append,
    })
}

/// Resolve the backup archive path for a source_file import.
pub fn backup_file_path(path: &str) -> Result<PathBuf> {
    let expanded = expand_home(path);
    if !Path::new(&expanded).is_file() {
        return Err(EngineError::LocalFile {
            path: expanded.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        });
    }
    Ok(expanded)
}

/// Read the declared config subset back from a remote instance, honoring the
/// source_file device special case.
pub fn model_from_remote(
    model: &mut InstanceModel,
    remote: &virtstate_client::Instance,
) -> Result<()> {
    model.config = strip_config(&remote.config, &model.config, model.computed_keys());

    // The pool/path steering device of a backup import is synthetic and not
    // reflected in remote state; overwriting it would diff forever.
    let keep_declared_devices = model.source_file.is_some() && !model.devices.is_empty();
    if !keep_declared_devices {
        model.devices = devices_from_wire(&remote.devices)?;
    }

    model.name = remote.name.clone();
    model.type_ = Some(remote.type_);
    model.description = if remote.description.is_empty() {
        None
    } else {
        Some(remote.description.clone())
    };
    model.ephemeral = Some(remote.ephemeral);
    model.status = Some(remote.status.clone());
    model.profiles = crate::model::ProfileSpec::explicit(remote.profiles.clone());
    Ok(())
}
