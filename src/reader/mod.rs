//! State Reader
//!
//! Rebuilds the current configuration model from the live control
//! filesystem. Reads are selective: only attributes the subsystem tags with
//! its non-default `[key]` marker enter the model, which keeps the diff
//! against the desired state minimal and prevents the engine from rewriting
//! defaults.
//!
//! Traversal mirrors the model: handlers and their devices, drivers and
//! their targets (LUNs, initiator groups), then device groups. The walkers
//! tolerate entries disappearing mid-traversal and simply return what was
//! readable; the next convergence run re-reconciles.

mod devices;
mod groups;
pub(crate) mod targets;

use tracing::debug;

use crate::config::{AttrMap, ScstConfig};
use crate::error::{Error, Result};
use crate::sysfs::{ScstSysfs, MGMT_FILE, RESULT_ATTR, SUSPEND_ATTR};

/// Reads the current live state from a control filesystem.
pub struct StateReader<'a> {
    sysfs: &'a ScstSysfs,
}

impl<'a> StateReader<'a> {
    pub fn new(sysfs: &'a ScstSysfs) -> Self {
        Self { sysfs }
    }

    /// Produce the current-state model.
    pub fn read_current(&self) -> Result<ScstConfig> {
        if !self.sysfs.available() {
            return Err(Error::Precondition(format!(
                "SCST control filesystem not found at {}",
                self.sysfs.root().display()
            )));
        }

        let (handlers, devices) = devices::read_handlers_and_devices(self.sysfs);
        let drivers = targets::read_drivers(self.sysfs);
        let device_groups = groups::read_device_groups(self.sysfs);
        let scst_attributes = self.read_root_attributes();

        debug!(
            devices = devices.len(),
            drivers = drivers.len(),
            device_groups = device_groups.len(),
            "current state read"
        );

        Ok(ScstConfig {
            handlers,
            devices,
            drivers,
            device_groups,
            scst_attributes,
        })
    }

    fn read_root_attributes(&self) -> AttrMap {
        let mut attributes = AttrMap::new();
        for entry in self.sysfs.list_dir(self.sysfs.root()) {
            if entry == MGMT_FILE || entry == RESULT_ATTR || entry == SUSPEND_ATTR {
                continue;
            }
            let path = self.sysfs.root().join(&entry);
            if self.sysfs.is_dir(&path) {
                continue;
            }
            if let Some(value) = self.sysfs.read_keyed_attribute(&path) {
                attributes.insert(entry, value);
            }
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::mock::MockScst;

    #[test]
    fn test_read_devices_and_root_attributes() {
        let mock = MockScst::new();
        let sysfs = mock.sysfs();
        sysfs
            .submit_management(
                &sysfs.handler_mgmt("vdisk_fileio"),
                "add_device d1 filename=/v/d1.img;blocksize=4096",
                true,
            )
            .unwrap();
        mock.set_file("setup_id", "0x42\n[key]\n");
        mock.set_file("max_tasklet_cmd", "16\n");

        let current = StateReader::new(&sysfs).read_current().unwrap();
        let device = &current.devices["d1"];
        assert_eq!(device.handler, "vdisk_fileio");
        assert_eq!(device.attributes["filename"], "/v/d1.img");
        assert_eq!(device.attributes["blocksize"], "4096");

        // Only keyed root attributes are captured.
        assert_eq!(current.scst_attributes.get("setup_id").unwrap(), "0x42");
        assert!(!current.scst_attributes.contains_key("max_tasklet_cmd"));
        assert!(!current.scst_attributes.contains_key(RESULT_ATTR));
    }

    #[test]
    fn test_read_targets_luns_and_groups() {
        let mock = MockScst::new();
        let sysfs = mock.sysfs();
        sysfs
            .submit_management(
                &sysfs.handler_mgmt("vdisk_fileio"),
                "add_device d1 filename=/v/d1.img",
                true,
            )
            .unwrap();
        sysfs
            .submit_management(&sysfs.driver_mgmt("iscsi"), "add_target iqn.x:t1", true)
            .unwrap();
        sysfs
            .submit_management(&sysfs.luns_mgmt("iscsi", "iqn.x:t1"), "add d1 0", true)
            .unwrap();
        sysfs
            .submit_management(
                &sysfs.ini_groups_mgmt("iscsi", "iqn.x:t1"),
                "create clients",
                true,
            )
            .unwrap();
        sysfs
            .submit_management(
                &sysfs.group_initiators_mgmt("iscsi", "iqn.x:t1", "clients"),
                "add iqn.client:host",
                true,
            )
            .unwrap();
        sysfs
            .submit_management(
                &sysfs.group_luns_mgmt("iscsi", "iqn.x:t1", "clients"),
                "add d1 3 read_only=1",
                true,
            )
            .unwrap();

        let current = StateReader::new(&sysfs).read_current().unwrap();
        let target = &current.drivers["iscsi"].targets["iqn.x:t1"];
        assert_eq!(target.luns[&0].device, "d1");
        let group = &target.groups["clients"];
        assert_eq!(group.initiators, vec!["iqn.client:host"]);
        assert_eq!(group.luns[&3].device, "d1");
        assert_eq!(group.luns[&3].attributes["read_only"], "1");

        // The auto-populated copy-manager LUN is visible to the reader.
        let cm = &current.drivers["copy_manager"].targets["copy_manager_tgt"];
        assert_eq!(cm.luns[&0].device, "d1");
    }

    #[test]
    fn test_read_device_groups() {
        let mock = MockScst::new();
        let sysfs = mock.sysfs();
        sysfs
            .submit_management(
                &sysfs.handler_mgmt("vdisk_fileio"),
                "add_device d1 filename=/v/d1.img",
                true,
            )
            .unwrap();
        sysfs
            .submit_management(&sysfs.device_groups_mgmt(), "create dg0", true)
            .unwrap();
        sysfs
            .submit_management(&sysfs.dg_devices_mgmt("dg0"), "add d1", true)
            .unwrap();
        sysfs
            .submit_management(&sysfs.dg_target_groups_mgmt("dg0"), "add controller_A", true)
            .unwrap();
        sysfs
            .submit_management(
                &sysfs.dg_target_group_dir("dg0", "controller_A").join("mgmt"),
                "add iqn.x:t1",
                true,
            )
            .unwrap();
        sysfs
            .write_attribute(
                &sysfs
                    .dg_target_group_dir("dg0", "controller_A")
                    .join("iqn.x:t1")
                    .join("rel_tgt_id"),
                "1",
                false,
            )
            .unwrap();

        let current = StateReader::new(&sysfs).read_current().unwrap();
        let group = &current.device_groups["dg0"];
        assert_eq!(group.devices, vec!["d1"]);
        let tg = &group.target_groups["controller_A"];
        assert_eq!(tg.targets, vec!["iqn.x:t1"]);
        assert_eq!(tg.target_attributes["iqn.x:t1"]["rel_tgt_id"], "1");
    }

    #[test]
    fn test_unavailable_root_is_a_precondition_error() {
        let mock = MockScst::new();
        let sysfs = crate::sysfs::ScstSysfs::with_backend(
            Box::new(mock),
            "/nowhere",
            std::time::Duration::from_secs(1),
        );
        let err = StateReader::new(&sysfs).read_current().unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
