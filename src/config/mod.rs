//! Configuration Model
//!
//! Typed description of an SCST configuration: device handlers, storage
//! devices, target drivers, targets, LUN assignments, initiator groups and
//! ALUA device groups, plus free-form global attributes on the subsystem
//! root.
//!
//! The same model describes both the *desired* state (produced by the
//! [`parser`]) and the *current* state (produced by [`crate::reader`]), so
//! the planner can diff the two symmetrically. All collections preserve
//! insertion order, which fixes the order in which the convergence engine
//! applies additions and updates.

pub mod parser;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Ordered attribute-name to string-value mapping.
///
/// Attribute bags are kept stringly-typed at the boundary; the kernel side
/// decides validity of unknown attributes.
pub type AttrMap = IndexMap<String, String>;

// =============================================================================
// Constants
// =============================================================================

/// Attribute that gates I/O on drivers and targets.
pub const ENABLED_ATTR: &str = "enabled";

/// Built-in driver that auto-maps devices for internal copy offload.
pub const COPY_MANAGER_DRIVER: &str = "copy_manager";

/// The single built-in target of the copy-manager driver.
pub const COPY_MANAGER_TARGET: &str = "copy_manager_tgt";

/// Creation-time parameters accepted by the vdisk_fileio handler mgmt file.
const VDISK_FILEIO_CREATE_PARAMS: &[&str] = &[
    "active",
    "async",
    "blocksize",
    "cluster_mode",
    "dif_filename",
    "dif_mode",
    "dif_static_app_tag",
    "dif_type",
    "filename",
    "numa_node_id",
    "nv_cache",
    "o_direct",
    "read_only",
    "removable",
    "rotational",
    "thin_provisioned",
    "tst",
    "t10_dev_id",
    "write_through",
];

/// Creation-time parameters accepted by the vdisk_blockio handler mgmt file.
const VDISK_BLOCKIO_CREATE_PARAMS: &[&str] = &[
    "active",
    "bind_alua_state",
    "blocksize",
    "cluster_mode",
    "dif_filename",
    "dif_mode",
    "dif_static_app_tag",
    "dif_type",
    "filename",
    "numa_node_id",
    "nv_cache",
    "read_only",
    "removable",
    "rotational",
    "thin_provisioned",
    "tst",
    "t10_dev_id",
    "write_through",
];

/// Creation-time parameters accepted by the vdisk_nullio handler mgmt file.
const VDISK_NULLIO_CREATE_PARAMS: &[&str] = &[
    "active",
    "blocksize",
    "dummy",
    "read_only",
    "removable",
    "rotational",
    "size",
    "size_mb",
    "t10_dev_id",
    "tst",
];

/// Creation-time parameters for a handler kind.
///
/// Pass-through handlers (dev_disk and friends) take no parameters at
/// creation time; the device name itself (H:C:I:L) identifies the backing
/// device.
pub fn creation_params(handler: &str) -> &'static [&'static str] {
    match handler {
        "vdisk_fileio" => VDISK_FILEIO_CREATE_PARAMS,
        "vdisk_blockio" => VDISK_BLOCKIO_CREATE_PARAMS,
        "vdisk_nullio" | "vcdrom" => VDISK_NULLIO_CREATE_PARAMS,
        _ => &[],
    }
}

/// The attribute a device of the given handler kind cannot be created
/// without, if any.
pub fn required_primary_attribute(handler: &str) -> Option<&'static str> {
    match handler {
        "vdisk_fileio" | "vdisk_blockio" => Some("filename"),
        _ => None,
    }
}

// =============================================================================
// Devices
// =============================================================================

/// A storage object belonging to exactly one handler.
///
/// The handler name is the kind discriminator: it selects the creation
/// parameter set and the required primary attribute. Everything else is an
/// ordered attribute bag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    pub handler: String,
    pub attributes: AttrMap,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: handler.into(),
            attributes: AttrMap::new(),
        }
    }

    /// Attributes that must be passed in the `add_device` command.
    pub fn creation_attributes(&self) -> AttrMap {
        let params = creation_params(&self.handler);
        self.attributes
            .iter()
            .filter(|(k, _)| params.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Attributes settable through sysfs after the device exists.
    pub fn post_creation_attributes(&self) -> AttrMap {
        let params = creation_params(&self.handler);
        self.attributes
            .iter()
            .filter(|(k, _)| !params.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Handler-level attributes. Devices themselves live in
/// [`ScstConfig::devices`], keyed by device name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub attributes: AttrMap,
}

// =============================================================================
// Targets
// =============================================================================

/// A LUN assignment: a device bound into a target or initiator group at a
/// logical unit number. The number itself is the key of the containing map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunConfig {
    pub device: String,
    pub attributes: AttrMap,
}

impl LunConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            attributes: AttrMap::new(),
        }
    }
}

/// A named subset of initiators with its own LUN map inside a target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitiatorGroupConfig {
    pub name: String,
    pub initiators: Vec<String>,
    pub luns: IndexMap<u64, LunConfig>,
    pub attributes: AttrMap,
}

/// A transport endpoint inside a driver: default LUN set, initiator groups
/// and an attribute bag. `enabled` lives in the attribute bag but is applied
/// in its own dedicated phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub luns: IndexMap<u64, LunConfig>,
    pub groups: IndexMap<String, InitiatorGroupConfig>,
    pub attributes: AttrMap,
}

impl TargetConfig {
    /// Whether the configuration asks for this target to end up enabled.
    pub fn wants_enabled(&self) -> bool {
        self.attributes.get(ENABLED_ATTR).map(String::as_str) == Some("1")
    }
}

/// A transport-layer target driver hosting zero or more targets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub targets: IndexMap<String, TargetConfig>,
    pub attributes: AttrMap,
}

impl DriverConfig {
    pub fn wants_enabled(&self) -> bool {
        self.attributes.get(ENABLED_ATTR).map(String::as_str) == Some("1")
    }
}

// =============================================================================
// Device Groups (ALUA)
// =============================================================================

/// A target group inside a device group: target references plus per-target
/// attributes (`rel_tgt_id`, `preferred`) and group attributes (`group_id`,
/// `state`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGroupConfig {
    pub name: String,
    pub targets: Vec<String>,
    pub target_attributes: IndexMap<String, AttrMap>,
    pub attributes: AttrMap,
}

/// A named collection of devices and target groups for ALUA multipath
/// configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceGroupConfig {
    pub name: String,
    pub devices: Vec<String>,
    pub target_groups: IndexMap<String, TargetGroupConfig>,
    pub attributes: AttrMap,
}

// =============================================================================
// Root
// =============================================================================

/// A complete SCST configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScstConfig {
    pub handlers: IndexMap<String, HandlerConfig>,
    pub devices: IndexMap<String, DeviceConfig>,
    pub drivers: IndexMap<String, DriverConfig>,
    pub device_groups: IndexMap<String, DeviceGroupConfig>,
    pub scst_attributes: AttrMap,
}

impl ScstConfig {
    /// Check the structural invariants of the model.
    ///
    /// Verified here, in this order:
    /// - every device referenced by a LUN assignment is declared,
    /// - devices of handler kinds with a required primary attribute carry it,
    /// - every target-group target reference names a declared target,
    /// - a device belongs to at most one device group.
    ///
    /// LUN-number uniqueness within a scope is structural: LUN sets are keyed
    /// by number, and the parser rejects duplicate numbers in one block.
    pub fn validate(&self) -> Result<()> {
        for (driver_name, driver) in &self.drivers {
            for (target_name, target) in &driver.targets {
                for (lun, lun_config) in &target.luns {
                    if !self.devices.contains_key(&lun_config.device) {
                        return Err(Error::Validation(format!(
                            "LUN {lun} of target '{driver_name}/{target_name}' references \
                             undeclared device '{}'",
                            lun_config.device
                        )));
                    }
                }
                for (group_name, group) in &target.groups {
                    for (lun, lun_config) in &group.luns {
                        if !self.devices.contains_key(&lun_config.device) {
                            return Err(Error::Validation(format!(
                                "LUN {lun} of group '{group_name}' in target \
                                 '{driver_name}/{target_name}' references undeclared \
                                 device '{}'",
                                lun_config.device
                            )));
                        }
                    }
                }
            }
        }

        for device in self.devices.values() {
            if let Some(attr) = required_primary_attribute(&device.handler) {
                if !device.attributes.contains_key(attr) {
                    return Err(Error::Validation(format!(
                        "device '{}' of handler '{}' is missing required attribute '{attr}'",
                        device.name, device.handler
                    )));
                }
            }
        }

        for (group_name, group) in &self.device_groups {
            for (tg_name, tg) in &group.target_groups {
                for target in &tg.targets {
                    let declared = self
                        .drivers
                        .values()
                        .any(|driver| driver.targets.contains_key(target));
                    if !declared {
                        return Err(Error::Validation(format!(
                            "target group '{group_name}/{tg_name}' references undeclared \
                             target '{target}'"
                        )));
                    }
                }
            }
        }

        let mut owners: IndexMap<&str, &str> = IndexMap::new();
        for (group_name, group) in &self.device_groups {
            for device in &group.devices {
                if let Some(previous) = owners.insert(device.as_str(), group_name.as_str()) {
                    return Err(Error::Validation(format!(
                        "device '{device}' belongs to device groups '{previous}' and \
                         '{group_name}'"
                    )));
                }
            }
        }

        Ok(())
    }
}
