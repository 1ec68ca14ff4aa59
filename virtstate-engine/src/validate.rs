//! Plan-time validation of the instance model.
//!
//! Every invariant here is enforced before any remote call is issued. The
//! checks accumulate into [`Diagnostics`] so a single pass reports every
//! problem, and a passing model yields the [`CreationSource`] the dispatcher
//! matches on.

use crate::error::{Diagnostics, EngineError, Result};
use crate::model::{
    CreationSource, DeviceSpec, DeviceType, ImageRef, InstanceModel, COMPUTED_KEY_PREFIXES,
};

/// Validate `model` for creation and fix its creation source.
///
/// Mutual exclusion of {image, source_file, source_instance} is decided here
/// once, so downstream code matches on the returned tagged source instead of
/// re-inspecting optional fields.
pub fn validate(model: &InstanceModel) -> Result<CreationSource> {
    let mut diags = Diagnostics::new();

    check_mutable(model, &mut diags);
    let source = resolve_source(model, &mut diags);

    if diags.is_empty() {
        // resolve_source returns Empty on conflicting sources, but in that
        // case diags is non-empty and we never get here.
        Ok(source)
    } else {
        Err(EngineError::Validation(diags))
    }
}

/// Validate `model` for an in-place update of an existing instance.
///
/// The creation source was resolved when the instance was created; the
/// source-conflict rules and the empty-source running precondition are
/// create-time checks and do not apply here. After a read-back the model
/// carries attributes (type, profiles, a derived running flag) the create
/// rules would reject for source_file or imported instances.
pub fn validate_update(model: &InstanceModel) -> Result<()> {
    let mut diags = Diagnostics::new();
    check_mutable(model, &mut diags);
    if diags.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Validation(diags))
    }
}

// Invariants on the mutable attributes, enforced on create and update both.
fn check_mutable(model: &InstanceModel, diags: &mut Diagnostics) {
    if model.name.is_empty() {
        diags.add_error("Invalid name", "instance name must not be empty");
    }

    for key in model.config.keys() {
        if let Some(prefix) = COMPUTED_KEY_PREFIXES.iter().find(|p| key.starts_with(*p)) {
            diags.add_error(
                format!("Invalid config key {key:?}"),
                format!("keys with the {prefix:?} prefix are managed by the server"),
            );
        }
    }

    check_devices(&model.devices, diags);
    check_files(model, diags);

    if model.ephemeral() && !model.running() {
        diags.add_error(
            "Invalid ephemeral",
            "ephemeral instances are destroyed on stop, so running must be true",
        );
    }
}

fn resolve_source(model: &InstanceModel, diags: &mut Diagnostics) -> CreationSource {
    let set = [
        model.image.is_some(),
        model.source_file.is_some(),
        model.source_instance.is_some(),
    ]
    .iter()
    .filter(|s| **s)
    .count();
    if set > 1 {
        diags.add_error(
            "Conflicting source",
            "at most one of image, source_file and source_instance may be set",
        );
        return CreationSource::Empty;
    }

    if let Some(image) = &model.image {
        return CreationSource::Image(ImageRef::parse(image));
    }

    if let Some(path) = &model.source_file {
        check_source_file_conflicts(model, diags);
        let pool = source_file_pool(&model.devices, diags);
        return CreationSource::BackupFile {
            path: path.clone(),
            pool,
        };
    }

    if let Some(source) = &model.source_instance {
        return CreationSource::Copy(source.clone());
    }

    // No source at all: the shell cannot boot, so a running request is a
    // configuration error rather than a runtime failure.
    if model.running() {
        diags.add_error(
            "Invalid running",
            "an instance created without image, source_file or source_instance \
             has nothing to boot; set running = false",
        );
    }
    CreationSource::Empty
}

fn check_source_file_conflicts(model: &InstanceModel, diags: &mut Diagnostics) {
    let conflicts: &[(&str, bool)] = &[
        ("description", model.description.is_some()),
        ("type", model.type_.is_some()),
        ("ephemeral", model.ephemeral.is_some()),
        ("profiles", !model.profiles.is_unset()),
        ("files", !model.files.is_empty()),
        ("config", !model.config.is_empty()),
    ];
    for (field, set) in conflicts {
        if *set {
            diags.add_error(
                format!("Invalid {field}"),
                "the backup archive supplies this attribute; it conflicts with source_file",
            );
        }
    }
}

/// Resolve the destination pool for a backup import.
///
/// Allowed device sets are none, or exactly one disk device whose
/// properties are exactly `path = "/"` plus `pool`.
fn source_file_pool(devices: &[DeviceSpec], diags: &mut Diagnostics) -> Option<String> {
    match devices {
        [] => None,
        [device] => {
            let pool = device.properties.get("pool");
            let path = device.properties.get("path");
            let shape_ok = device.type_ == DeviceType::Disk
                && device.properties.len() == 2
                && path.map(String::as_str) == Some("/")
                && pool.is_some();
            if shape_ok {
                pool.cloned()
            } else {
                diags.add_error(
                    format!("Invalid device {:?}", device.name),
                    "with source_file the only allowed device is a disk with \
                     exactly the properties path = \"/\" and pool",
                );
                None
            }
        }
        _ => {
            diags.add_error(
                "Invalid devices",
                "with source_file at most one device (the root disk pool override) is allowed",
            );
            None
        }
    }
}

fn check_devices(devices: &[DeviceSpec], diags: &mut Diagnostics) {
    for (i, device) in devices.iter().enumerate() {
        if device.name.is_empty() {
            diags.add_error("Invalid device", "device name must not be empty");
        }
        if devices[..i].iter().any(|d| d.name == device.name) {
            diags.add_error(
                format!("Duplicate device {:?}", device.name),
                "device names must be unique per instance",
            );
        }
        if device.properties.contains_key("type") {
            diags.add_error(
                format!("Invalid device {:?}", device.name),
                "the device type is set by the type attribute, not a \"type\" property",
            );
        }
    }
}

fn check_files(model: &InstanceModel, diags: &mut Diagnostics) {
    if !model.files.is_empty() && !model.running() {
        diags.add_error(
            "Invalid files",
            "files can only be pushed into a running instance; set running = true",
        );
    }
    for file in &model.files {
        if file.target_path.is_empty() {
            diags.add_error("Invalid file", "target_path must not be empty");
        }
        match (&file.content, &file.source_path) {
            (Some(_), Some(_)) => diags.add_error(
                format!("Invalid file {:?}", file.target_path),
                "content and source_path are mutually exclusive",
            ),
            (None, None) => diags.add_error(
                format!("Invalid file {:?}", file.target_path),
                "one of content or source_path is required",
            ),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileSpec, ProfileSpec, SourceInstance};
    use std::collections::BTreeMap;

    fn image_model(name: &str) -> InstanceModel {
        let mut model = InstanceModel::new(name);
        model.image = Some("images:debian/12".to_string());
        model
    }

    #[test]
    fn test_image_model_passes() {
        let source = validate(&image_model("c1")).unwrap();
        assert_eq!(
            source,
            CreationSource::Image(ImageRef::parse("images:debian/12"))
        );
    }

    #[test]
    fn test_conflicting_sources_rejected() {
        let mut model = image_model("c1");
        model.source_file = Some("/tmp/backup.tar.gz".to_string());
        let err = validate(&model).unwrap_err();
        assert!(err.to_string().contains("at most one of"));
    }

    #[test]
    fn test_ephemeral_requires_running() {
        let mut model = image_model("c1");
        model.ephemeral = Some(true);
        model.running = Some(false);
        assert!(validate(&model).is_err());

        model.running = Some(true);
        assert!(validate(&model).is_ok());
    }

    #[test]
    fn test_empty_source_must_not_run() {
        // running defaults to true, so a bare model is rejected.
        let model = InstanceModel::new("c1");
        assert!(validate(&model).is_err());

        let mut stopped = InstanceModel::new("c1");
        stopped.running = Some(false);
        assert_eq!(validate(&stopped).unwrap(), CreationSource::Empty);
    }

    #[test]
    fn test_computed_config_keys_rejected() {
        let mut model = image_model("c1");
        model
            .config
            .insert("volatile.uuid".to_string(), "abc".to_string());
        model
            .config
            .insert("image.os".to_string(), "Debian".to_string());
        model
            .config
            .insert("user.mykey".to_string(), "ok".to_string());
        let err = validate(&model).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("volatile."));
        assert!(msg.contains("image."));
        assert!(!msg.contains("user.mykey"));
    }

    #[test]
    fn test_source_file_conflicts() {
        let mut model = InstanceModel::new("c1");
        model.source_file = Some("/tmp/backup.tar.gz".to_string());
        model.running = Some(false);
        model.profiles = ProfileSpec::explicit(vec!["default".to_string()]);
        model
            .config
            .insert("limits.cpu".to_string(), "2".to_string());
        let err = validate(&model).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("profiles"));
        assert!(msg.contains("config"));
    }

    #[test]
    fn test_source_file_pool_device() {
        let mut model = InstanceModel::new("c1");
        model.source_file = Some("/tmp/backup.tar.gz".to_string());
        model.running = Some(false);
        model.devices.push(DeviceSpec {
            name: "root".to_string(),
            type_: DeviceType::Disk,
            properties: BTreeMap::from([
                ("path".to_string(), "/".to_string()),
                ("pool".to_string(), "fast".to_string()),
            ]),
        });

        match validate(&model).unwrap() {
            CreationSource::BackupFile { path, pool } => {
                assert_eq!(path, "/tmp/backup.tar.gz");
                assert_eq!(pool.as_deref(), Some("fast"));
            }
            other => panic!("unexpected source {other:?}"),
        }

        // A mount point other than the root breaks the shape.
        model.devices[0]
            .properties
            .insert("path".to_string(), "/data".to_string());
        assert!(validate(&model).is_err());

        // So do extra properties.
        model.devices[0]
            .properties
            .insert("path".to_string(), "/".to_string());
        model.devices[0]
            .properties
            .insert("size".to_string(), "10GiB".to_string());
        assert!(validate(&model).is_err());
    }

    #[test]
    fn test_copy_source() {
        let mut model = InstanceModel::new("c2");
        model.source_instance = Some(SourceInstance {
            project: "default".to_string(),
            name: "c1".to_string(),
            snapshot: Some("snap0".to_string()),
        });
        match validate(&model).unwrap() {
            CreationSource::Copy(source) => assert_eq!(source.snapshot.as_deref(), Some("snap0")),
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn test_files_require_running_and_one_source() {
        let mut model = image_model("c1");
        model.running = Some(false);
        model.files.push(FileSpec {
            content: Some("hello".to_string()),
            target_path: "/root/hello".to_string(),
            ..Default::default()
        });
        assert!(validate(&model).is_err());

        model.running = Some(true);
        assert!(validate(&model).is_ok());

        model.files[0].source_path = Some("/tmp/hello".to_string());
        assert!(validate(&model).is_err());
    }

    #[test]
    fn test_update_accepts_synced_backup_instance() {
        // After a read-back, a source_file instance carries type, ephemeral
        // and profiles; only the create rules treat those as conflicts.
        let mut model = InstanceModel::new("restored");
        model.source_file = Some("/var/backups/restored.tar.gz".to_string());
        model.type_ = Some(virtstate_client::InstanceType::Container);
        model.ephemeral = Some(false);
        model.profiles = ProfileSpec::explicit(vec!["default".to_string()]);
        model.running = Some(false);
        model.devices.push(DeviceSpec {
            name: "root".to_string(),
            type_: DeviceType::Disk,
            properties: BTreeMap::from([
                ("path".to_string(), "/".to_string()),
                ("pool".to_string(), "fast".to_string()),
            ]),
        });

        assert!(validate(&model).is_err());
        assert!(validate_update(&model).is_ok());
    }

    #[test]
    fn test_update_accepts_running_instance_without_source() {
        // An imported instance has no source fields at all; running is a
        // create-time precondition for the empty path, not an update rule.
        let mut model = InstanceModel::new("adopted");
        model.running = Some(true);

        assert!(validate(&model).is_err());
        assert!(validate_update(&model).is_ok());
    }

    #[test]
    fn test_update_still_rejects_computed_config_keys() {
        let mut model = InstanceModel::new("c1");
        model
            .config
            .insert("volatile.uuid".to_string(), "abc".to_string());
        assert!(validate_update(&model).is_err());
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let mut model = image_model("c1");
        for _ in 0..2 {
            model.devices.push(DeviceSpec {
                name: "eth0".to_string(),
                type_: DeviceType::Nic,
                properties: BTreeMap::new(),
            });
        }
        let err = validate(&model).unwrap_err();
        assert!(err.to_string().contains("Duplicate device"));
    }
}
