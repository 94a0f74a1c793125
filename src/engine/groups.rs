//! Device-group phase: ALUA device groups, target groups and their
//! per-target attributes.

use super::ConvergenceEngine;
use crate::error::Result;
use crate::plan::ConvergencePlan;
use crate::sysfs::MGMT_FILE;

impl ConvergenceEngine {
    pub(crate) fn phase_device_groups(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for name in &plan.device_group_creations {
            let mgmt = self.sysfs.device_groups_mgmt();
            self.mgmt_fatal(&mgmt, &format!("create {name}"))?;
        }
        for (name, attrs) in &plan.device_group_attr_updates {
            for (attr, value) in attrs {
                let path = self.sysfs.device_group_dir(name).join(attr);
                self.attr_logged(
                    &path,
                    value,
                    &format!("set device group attribute {name}.{attr}"),
                )?;
            }
        }
        for (group, device) in &plan.dg_member_additions {
            let mgmt = self.sysfs.dg_devices_mgmt(group);
            self.mgmt_logged(
                &mgmt,
                &format!("add {device}"),
                &format!("add device {device} to device group {group}"),
            )?;
        }
        for (group, tg) in &plan.target_group_creations {
            let mgmt = self.sysfs.dg_target_groups_mgmt(group);
            self.mgmt_fatal(&mgmt, &format!("add {tg}"))?;
        }
        for (group, tg, target) in &plan.tg_member_additions {
            let mgmt = self.sysfs.dg_target_group_dir(group, tg).join(MGMT_FILE);
            self.mgmt_logged(
                &mgmt,
                &format!("add {target}"),
                &format!("add target {target} to target group {group}/{tg}"),
            )?;
        }
        for (group, tg, attrs) in &plan.tg_attr_updates {
            for (attr, value) in attrs {
                let path = self.sysfs.dg_target_group_dir(group, tg).join(attr);
                self.attr_logged(
                    &path,
                    value,
                    &format!("set target group attribute {group}/{tg}.{attr}"),
                )?;
            }
        }
        for (group, tg, target, attrs) in &plan.tg_target_attr_updates {
            for (attr, value) in attrs {
                let path = self
                    .sysfs
                    .dg_target_group_dir(group, tg)
                    .join(target)
                    .join(attr);
                self.attr_logged(
                    &path,
                    value,
                    &format!("set target attribute {group}/{tg}/{target}.{attr}"),
                )?;
            }
        }
        Ok(())
    }

    /// Remove a device group and all its contents: target groups first,
    /// then device membership, then the group itself.
    pub(crate) fn remove_device_group(&mut self, name: &str) -> Result<()> {
        let tg_dir = self.sysfs.dg_target_groups_dir(name);
        let tg_mgmt = self.sysfs.dg_target_groups_mgmt(name);
        for tg in self.sysfs.entries(&tg_dir) {
            if self.sysfs.is_dir(&tg_dir.join(&tg)) {
                self.mgmt_logged(
                    &tg_mgmt,
                    &format!("del {tg}"),
                    &format!("remove target group {name}/{tg}"),
                )?;
            }
        }

        let devices_dir = self.sysfs.dg_devices_dir(name);
        let devices_mgmt = self.sysfs.dg_devices_mgmt(name);
        for device in self.sysfs.entries(&devices_dir) {
            self.mgmt_logged(
                &devices_mgmt,
                &format!("del {device}"),
                &format!("remove device {device} from device group {name}"),
            )?;
        }

        let mgmt = self.sysfs.device_groups_mgmt();
        self.mgmt_logged(
            &mgmt,
            &format!("del {name}"),
            &format!("remove device group {name}"),
        )
    }
}
