//! Target phases: target/group skeleton, LUN assignments, copy-manager
//! pruning and target teardown.

use std::path::PathBuf;

use tracing::debug;

use super::ConvergenceEngine;
use crate::config::{ScstConfig, COPY_MANAGER_DRIVER, COPY_MANAGER_TARGET, ENABLED_ATTR};
use crate::error::Result;
use crate::plan::{ConvergencePlan, LunAssignment};

/// Attributes that the subsystem only accepts while the owning target is
/// disabled.
const REQUIRES_DISABLED_TARGET_ATTRS: &[&str] = &["allowed_portal"];

/// Known defaults for driver attributes being reset. A newline asks the
/// subsystem to restore its own default.
fn driver_attribute_default(driver: &str, attr: &str) -> &'static str {
    match (driver, attr) {
        ("iscsi", "link_local") => "1",
        ("iscsi", "trace_level") => "0",
        _ => "\n",
    }
}

/// Config files escape `#` and `*` in initiator names; the control
/// filesystem wants them raw.
fn unescape_initiator(name: &str) -> String {
    name.replace("\\#", "#").replace("\\*", "*")
}

impl ConvergenceEngine {
    // -------------------------------------------------------------------------
    // Phase 3: skeleton
    // -------------------------------------------------------------------------

    pub(crate) fn phase_targets(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for (driver, target) in &plan.target_creations {
            let mgmt = self.sysfs.driver_mgmt(driver);
            self.mgmt_fatal(&mgmt, &format!("add_target {target}"))?;
        }
        for (driver, target, attrs) in &plan.target_attr_updates {
            self.apply_target_attributes(driver, target, attrs)?;
        }
        for (driver, target, group) in &plan.group_creations {
            let mgmt = self.sysfs.ini_groups_mgmt(driver, target);
            self.mgmt_fatal(&mgmt, &format!("create {group}"))?;
        }
        for (driver, target, group, initiator) in &plan.initiator_additions {
            let clean = unescape_initiator(initiator);
            let mgmt = self.sysfs.group_initiators_mgmt(driver, target, group);
            self.mgmt_logged(
                &mgmt,
                &format!("add {clean}"),
                &format!("add initiator {clean} to {driver}/{target}/{group}"),
            )?;
        }
        for (driver, target, group, initiator) in &plan.initiator_removals {
            let clean = unescape_initiator(initiator);
            let mgmt = self.sysfs.group_initiators_mgmt(driver, target, group);
            self.mgmt_logged(
                &mgmt,
                &format!("del {clean}"),
                &format!("remove initiator {clean} from {driver}/{target}/{group}"),
            )?;
        }
        Ok(())
    }

    fn apply_target_attributes(
        &mut self,
        driver: &str,
        target: &str,
        attrs: &crate::config::AttrMap,
    ) -> Result<()> {
        if attrs
            .keys()
            .any(|key| REQUIRES_DISABLED_TARGET_ATTRS.contains(&key.as_str()))
        {
            self.disable_for_update(driver, target)?;
        }
        for (attr, value) in attrs {
            let path = self.sysfs.target_dir(driver, target).join(attr);
            self.attr_logged(
                &path,
                value,
                &format!("set target attribute {driver}/{target}.{attr}"),
            )?;
        }
        Ok(())
    }

    /// The update set contains an attribute that can only be written while
    /// the target is disabled. Disable it here; the dedicated enable phase
    /// restores the desired state afterwards.
    fn disable_for_update(&mut self, driver: &str, target: &str) -> Result<()> {
        self.check_cancelled()?;
        let path = self.sysfs.target_dir(driver, target).join(ENABLED_ATTR);
        if !self.sysfs.exists(&path) {
            return Ok(());
        }
        if self.sysfs.read_attribute(&path).ok().as_deref() == Some("1") {
            debug!(driver, target, "disabling target for attribute update");
            self.attr_quiet(&path, "0");
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 4: LUN assignments
    // -------------------------------------------------------------------------

    pub(crate) fn phase_luns(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for assignment in &plan.lun_assignments {
            self.assign_lun(assignment)?;
        }
        for update in &plan.lun_attr_updates {
            let (_, lun_dir) = self.lun_paths(
                &update.driver,
                &update.target,
                update.group.as_deref(),
                update.lun,
            );
            for (attr, value) in &update.attributes {
                self.attr_logged(
                    &lun_dir.join(attr),
                    value,
                    &format!(
                        "set LUN attribute {}/{} LUN {}.{attr}",
                        update.driver, update.target, update.lun
                    ),
                )?;
            }
        }
        Ok(())
    }

    fn lun_paths(
        &self,
        driver: &str,
        target: &str,
        group: Option<&str>,
        lun: u64,
    ) -> (PathBuf, PathBuf) {
        match group {
            Some(g) => (
                self.sysfs.group_luns_mgmt(driver, target, g),
                self.sysfs
                    .group_luns_dir(driver, target, g)
                    .join(lun.to_string()),
            ),
            None => (
                self.sysfs.luns_mgmt(driver, target),
                self.sysfs.lun_dir(driver, target, lun),
            ),
        }
    }

    fn assign_lun(&mut self, assignment: &LunAssignment) -> Result<()> {
        let (mgmt, lun_dir) = self.lun_paths(
            &assignment.driver,
            &assignment.target,
            assignment.group.as_deref(),
            assignment.lun,
        );

        // Phase 1 never touches the copy-manager LUN set, and device
        // creation auto-populates it, so the slot may already be taken here.
        let mut verb = "add";
        if assignment.driver == COPY_MANAGER_DRIVER {
            match self.sysfs.link_name(&lun_dir.join("device")) {
                Some(existing) if existing == assignment.device => return Ok(()),
                Some(_) => verb = "replace",
                None => {}
            }
        }

        let mut command = format!("{verb} {} {}", assignment.device, assignment.lun);
        if !assignment.create_args.is_empty() {
            let params: Vec<String> = assignment
                .create_args
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            command = format!("{command} {}", params.join(";"));
        }
        self.mgmt_fatal(&mgmt, &command)?;

        for (attr, value) in &assignment.post_attrs {
            self.attr_logged(
                &lun_dir.join(attr),
                value,
                &format!(
                    "set LUN attribute {}/{} LUN {}.{attr}",
                    assignment.driver, assignment.target, assignment.lun
                ),
            )?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phase 5: copy-manager pruning
    // -------------------------------------------------------------------------

    /// Remove auto-generated copy-manager assignments not present in the
    /// declared copy-manager LUN set. Runs after device creation and LUN
    /// assignment so the auto-populated entries are observable. A
    /// configuration that does not declare the copy-manager target leaves
    /// the auto-populated set untouched.
    pub(crate) fn phase_copy_manager(&mut self, desired: &ScstConfig) -> Result<()> {
        let Some(driver) = desired.drivers.get(COPY_MANAGER_DRIVER) else {
            return Ok(());
        };
        let Some(target) = driver.targets.get(COPY_MANAGER_TARGET) else {
            return Ok(());
        };
        if target.luns.is_empty() {
            return Ok(());
        }

        let luns_dir = self.sysfs.luns_dir(COPY_MANAGER_DRIVER, COPY_MANAGER_TARGET);
        let mgmt = self.sysfs.luns_mgmt(COPY_MANAGER_DRIVER, COPY_MANAGER_TARGET);
        let mut live: Vec<u64> = self
            .sysfs
            .entries(&luns_dir)
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        live.sort_unstable();

        for number in live {
            let device = self
                .sysfs
                .link_name(&luns_dir.join(number.to_string()).join("device"));
            let keep = device
                .as_deref()
                .map(|d| {
                    target
                        .luns
                        .get(&number)
                        .map(|want| want.device == d)
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !keep {
                self.mgmt_logged(
                    &mgmt,
                    &format!("del {number}"),
                    &format!("prune copy-manager LUN {number}"),
                )?;
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    /// Remove a target and everything inside it: disable, clear the default
    /// LUN set, empty and delete each initiator group, then `del_target`.
    pub(crate) fn remove_target(&mut self, driver: &str, target: &str) -> Result<()> {
        self.check_cancelled()?;
        let target_dir = self.sysfs.target_dir(driver, target);
        let enabled = target_dir.join(ENABLED_ATTR);
        if self.sysfs.exists(&enabled) {
            self.attr_quiet(&enabled, "0");
        }

        let luns_mgmt = self.sysfs.luns_mgmt(driver, target);
        if self.sysfs.exists(&luns_mgmt) {
            self.mgmt_logged(&luns_mgmt, "clear", &format!("clear LUNs of {driver}/{target}"))?;
        }

        let ini_groups_dir = self.sysfs.ini_groups_dir(driver, target);
        for group in self.sysfs.entries(&ini_groups_dir) {
            if self.sysfs.is_dir(&ini_groups_dir.join(&group)) {
                self.remove_group(driver, target, &group)?;
            }
        }

        let mgmt = self.sysfs.driver_mgmt(driver);
        self.mgmt_logged(
            &mgmt,
            &format!("del_target {target}"),
            &format!("remove target {driver}/{target}"),
        )
    }

    pub(crate) fn remove_group(&mut self, driver: &str, target: &str, group: &str) -> Result<()> {
        let group_luns_mgmt = self.sysfs.group_luns_mgmt(driver, target, group);
        if self.sysfs.exists(&group_luns_mgmt) {
            self.mgmt_logged(
                &group_luns_mgmt,
                "clear",
                &format!("clear LUNs of group {driver}/{target}/{group}"),
            )?;
        }
        let mgmt = self.sysfs.ini_groups_mgmt(driver, target);
        self.mgmt_logged(
            &mgmt,
            &format!("del {group}"),
            &format!("remove initiator group {driver}/{target}/{group}"),
        )
    }

    /// Reset a driver attribute the desired configuration no longer
    /// mentions.
    pub(crate) fn reset_driver_attribute(&mut self, driver: &str, attr: &str) -> Result<()> {
        let path = self.sysfs.driver_dir(driver).join(attr);
        if !self.sysfs.exists(&path) {
            return Ok(());
        }
        let value = driver_attribute_default(driver, attr);
        self.attr_logged(
            &path,
            value,
            &format!("reset driver attribute {driver}.{attr}"),
        )
    }
}
