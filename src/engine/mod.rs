//! Convergence Engine
//!
//! Single-pass orchestrator that drives the live subsystem to the desired
//! configuration. The engine reads the current state, builds a
//! [`ConvergencePlan`] and executes it through the control-filesystem
//! adapter in a strict phase order:
//!
//! 0. load required kernel modules,
//! 1. conflict removal in reverse dependency order,
//! 2. devices add/update,
//! 3. driver/target skeleton (targets, initiator groups, initiators),
//! 4. LUN assignments,
//! 5. copy-manager pruning,
//! 6. device groups,
//! 7. enable targets,
//! 8. enable drivers,
//! 9. driver and global attributes.
//!
//! Execution is single-threaded with blocking I/O: the control surface is
//! not transactional across files, so ordering is the only correctness
//! tool available. Two concurrent runs against the same subsystem are
//! undefined; callers must serialize.
//!
//! Error policy: removals and attribute updates log their failures and the
//! run continues, aggregating into a partial-convergence outcome; creations
//! that later phases depend on, and enable writes, are fatal. Cancellation
//! is cooperative and checked between mutations, never mid-operation, and
//! no cleanup of partial state is attempted.

mod devices;
mod groups;
mod targets;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{ScstConfig, COPY_MANAGER_DRIVER, COPY_MANAGER_TARGET, ENABLED_ATTR};
use crate::error::{Error, Result};
use crate::modules::ModuleManager;
use crate::plan::ConvergencePlan;
use crate::reader::StateReader;
use crate::sysfs::{ScstSysfs, MGMT_FILE};

// =============================================================================
// Options and Outcome
// =============================================================================

/// Caller-selectable behavior for one convergence run.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Write this value to the global `suspend` attribute before the first
    /// mutating phase and restore 0 afterwards. Shortens the window in
    /// which initiators observe a partial configuration.
    pub suspend: Option<u32>,
}

/// Outcome of a fully successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    /// Number of mutating control-filesystem writes performed.
    pub mutations: usize,
}

// =============================================================================
// Engine
// =============================================================================

/// Applies desired configurations to a live subsystem.
pub struct ConvergenceEngine {
    sysfs: ScstSysfs,
    modules: ModuleManager,
    cancel: Arc<AtomicBool>,
    mutations: usize,
    failures: Vec<String>,
}

impl ConvergenceEngine {
    pub fn new(sysfs: ScstSysfs, modules: ModuleManager) -> Self {
        Self {
            sysfs,
            modules,
            cancel: Arc::new(AtomicBool::new(false)),
            mutations: 0,
            failures: Vec::new(),
        }
    }

    pub fn sysfs(&self) -> &ScstSysfs {
        &self.sysfs
    }

    /// Flag to request cooperative cancellation between mutations.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Converge the live subsystem to `desired` in a single pass.
    ///
    /// Applying the same configuration twice performs mutations only on the
    /// first run.
    pub fn apply(&mut self, desired: &ScstConfig, options: &EngineOptions) -> Result<ApplyReport> {
        self.mutations = 0;
        self.failures.clear();

        desired.validate()?;
        self.modules.ensure_loaded(desired)?;

        let current = StateReader::new(&self.sysfs).read_current()?;
        let plan = ConvergencePlan::build(desired, &current);
        if plan.is_empty() {
            debug!("configuration already converged");
        } else {
            info!(
                removals = plan.removals.devices.len() + plan.removals.targets.len(),
                device_creations = plan.device_creations.len(),
                target_creations = plan.target_creations.len(),
                lun_assignments = plan.lun_assignments.len(),
                "applying configuration"
            );
        }

        let suspended = match options.suspend {
            Some(value) => {
                self.suspend_io(value)?;
                true
            }
            None => false,
        };
        let outcome = self.run_phases(desired, &plan);
        if suspended {
            self.resume_io();
        }
        outcome?;
        self.finish()
    }

    /// Remove the complete configuration, leaving only module-owned entities
    /// (driver directories and the built-in copy-manager target, whose LUN
    /// set is cleared).
    pub fn clear(&mut self, options: &EngineOptions) -> Result<ApplyReport> {
        self.mutations = 0;
        self.failures.clear();

        if !self.sysfs.available() {
            return Err(Error::Precondition(format!(
                "SCST control filesystem not found at {}",
                self.sysfs.root().display()
            )));
        }
        info!("clearing all configuration");

        let suspended = match options.suspend {
            Some(value) => {
                self.suspend_io(value)?;
                true
            }
            None => false,
        };
        let outcome = self.clear_all();
        if suspended {
            self.resume_io();
        }
        outcome?;
        self.finish()
    }

    fn finish(&mut self) -> Result<ApplyReport> {
        if self.failures.is_empty() {
            info!(mutations = self.mutations, "convergence complete");
            Ok(ApplyReport {
                mutations: self.mutations,
            })
        } else {
            Err(Error::PartialConvergence {
                failures: std::mem::take(&mut self.failures),
            })
        }
    }

    fn run_phases(&mut self, desired: &ScstConfig, plan: &ConvergencePlan) -> Result<()> {
        self.phase_removals(plan)?;
        self.phase_devices(desired, plan)?;
        self.phase_targets(plan)?;
        self.phase_luns(plan)?;
        self.phase_copy_manager(desired)?;
        self.phase_device_groups(plan)?;
        self.phase_enable_targets(plan)?;
        self.phase_enable_drivers(plan)?;
        self.phase_driver_attributes(plan)?;
        self.phase_global_attributes(plan)
    }

    // -------------------------------------------------------------------------
    // Phase 1: conflict removal
    // -------------------------------------------------------------------------

    fn phase_removals(&mut self, plan: &ConvergencePlan) -> Result<()> {
        let removals = &plan.removals;
        for name in &removals.device_groups {
            self.remove_device_group(name)?;
        }
        for (group, device) in &removals.dg_members {
            let mgmt = self.sysfs.dg_devices_mgmt(group);
            self.mgmt_logged(
                &mgmt,
                &format!("del {device}"),
                &format!("remove device {device} from device group {group}"),
            )?;
        }
        for (group, tg, target) in &removals.target_group_members {
            let mgmt = self.sysfs.dg_target_group_dir(group, tg).join(MGMT_FILE);
            self.mgmt_logged(
                &mgmt,
                &format!("del {target}"),
                &format!("remove target {target} from target group {group}/{tg}"),
            )?;
        }
        for (group, tg) in &removals.target_groups {
            let mgmt = self.sysfs.dg_target_groups_mgmt(group);
            self.mgmt_logged(
                &mgmt,
                &format!("del {tg}"),
                &format!("remove target group {group}/{tg}"),
            )?;
        }
        for (driver, target, group, lun) in &removals.group_luns {
            let mgmt = self.sysfs.group_luns_mgmt(driver, target, group);
            self.mgmt_logged(
                &mgmt,
                &format!("del {lun}"),
                &format!("remove LUN {lun} from group {driver}/{target}/{group}"),
            )?;
        }
        for (driver, target, group) in &removals.groups {
            self.remove_group(driver, target, group)?;
        }
        for (driver, target, lun) in &removals.target_luns {
            let mgmt = self.sysfs.luns_mgmt(driver, target);
            self.mgmt_logged(
                &mgmt,
                &format!("del {lun}"),
                &format!("remove LUN {lun} from {driver}/{target}"),
            )?;
        }
        for (driver, target) in &removals.targets {
            self.remove_target(driver, target)?;
        }
        for (driver, attr) in &removals.driver_attributes {
            self.reset_driver_attribute(driver, attr)?;
        }
        for (handler, device) in &removals.devices {
            self.remove_device(handler, device)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Phases 7-9: enables and late attributes
    // -------------------------------------------------------------------------

    fn phase_enable_targets(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for (driver, target) in &plan.enable_targets {
            let path = self.sysfs.target_dir(driver, target).join(ENABLED_ATTR);
            self.enable_entity(&path)?;
        }
        Ok(())
    }

    fn phase_enable_drivers(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for driver in &plan.enable_drivers {
            let path = self.sysfs.driver_dir(driver).join(ENABLED_ATTR);
            self.enable_entity(&path)?;
        }
        Ok(())
    }

    /// Enable-phase failures are fatal: a target left disabled after a
    /// successful-looking run would silently serve nothing.
    fn enable_entity(&mut self, path: &Path) -> Result<()> {
        self.check_cancelled()?;
        if self.sysfs.read_attribute(path).ok().as_deref() == Some("1") {
            return Ok(());
        }
        self.sysfs.write_attribute(path, "1", false)?;
        self.mutations += 1;
        debug!(path = %path.display(), "enabled");
        Ok(())
    }

    fn phase_driver_attributes(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for (driver, attr, value) in &plan.driver_attr_updates {
            let path = self.sysfs.driver_dir(driver).join(attr);
            self.attr_logged(
                &path,
                value,
                &format!("set driver attribute {driver}.{attr}"),
            )?;
        }
        Ok(())
    }

    fn phase_global_attributes(&mut self, plan: &ConvergencePlan) -> Result<()> {
        for (attr, value) in &plan.scst_attr_updates {
            let path = self.sysfs.root().join(attr);
            self.attr_logged(&path, value, &format!("set global attribute {attr}"))?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Clear
    // -------------------------------------------------------------------------

    fn clear_all(&mut self) -> Result<()> {
        // Disable every driver up front so nothing accepts I/O mid-teardown.
        for driver in self.sysfs.entries(&self.sysfs.targets_dir()) {
            let enabled = self.sysfs.driver_dir(&driver).join(ENABLED_ATTR);
            if self.sysfs.exists(&enabled) {
                self.check_cancelled()?;
                self.attr_quiet(&enabled, "0");
            }
        }

        for group in self.sysfs.entries(&self.sysfs.device_groups_dir()) {
            if self.sysfs.is_dir(&self.sysfs.device_group_dir(&group)) {
                self.remove_device_group(&group)?;
            }
        }

        for driver in self.sysfs.entries(&self.sysfs.targets_dir()) {
            let driver_dir = self.sysfs.driver_dir(&driver);
            if !self.sysfs.is_dir(&driver_dir) {
                continue;
            }
            for entry in self.sysfs.entries(&driver_dir) {
                let path = driver_dir.join(&entry);
                if !crate::reader::targets::is_target_dir(&self.sysfs, &path) {
                    continue;
                }
                if driver == COPY_MANAGER_DRIVER && entry == COPY_MANAGER_TARGET {
                    // Built-in permanent target: only its LUN set goes.
                    let mgmt = self.sysfs.luns_mgmt(&driver, &entry);
                    self.mgmt_logged(&mgmt, "clear", "clear copy-manager LUNs")?;
                } else {
                    self.remove_target(&driver, &entry)?;
                }
            }
        }

        for handler in self.sysfs.entries(&self.sysfs.handlers_dir()) {
            let handler_dir = self.sysfs.handler_dir(&handler);
            if !self.sysfs.is_dir(&handler_dir) {
                continue;
            }
            for device in self.sysfs.entries(&handler_dir) {
                if self.sysfs.is_dir(&handler_dir.join(&device)) {
                    self.remove_device(&handler, &device)?;
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // I/O suspension
    // -------------------------------------------------------------------------

    fn suspend_io(&mut self, value: u32) -> Result<()> {
        let path = self.sysfs.suspend_path();
        self.sysfs
            .write_attribute(&path, &value.to_string(), false)?;
        self.mutations += 1;
        info!(value, "subsystem I/O suspended");
        Ok(())
    }

    /// Restoration failures are not fatal: the configuration has been
    /// applied and the subsystem recovers on its own.
    fn resume_io(&mut self) {
        let path = self.sysfs.suspend_path();
        match self.sysfs.write_attribute(&path, "0", false) {
            Ok(()) => {
                self.mutations += 1;
                info!("subsystem I/O resumed");
            }
            Err(e) => warn!(error = %e, "failed to restore I/O suspension"),
        }
    }

    // -------------------------------------------------------------------------
    // Write helpers
    // -------------------------------------------------------------------------

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Management command whose failure aborts the run.
    pub(crate) fn mgmt_fatal(&mut self, path: &Path, command: &str) -> Result<()> {
        self.check_cancelled()?;
        self.sysfs.submit_management(path, command, true)?;
        self.mutations += 1;
        Ok(())
    }

    /// Management command whose failure is recorded and skipped.
    pub(crate) fn mgmt_logged(&mut self, path: &Path, command: &str, context: &str) -> Result<()> {
        self.check_cancelled()?;
        match self.sysfs.submit_management(path, command, true) {
            Ok(()) => self.mutations += 1,
            Err(e) => self.note_failure(context, &e),
        }
        Ok(())
    }

    /// Attribute write whose failure is recorded and skipped.
    pub(crate) fn attr_logged(&mut self, path: &Path, value: &str, context: &str) -> Result<()> {
        self.check_cancelled()?;
        match self.sysfs.write_attribute(path, value, false) {
            Ok(()) => self.mutations += 1,
            Err(e) => self.note_failure(context, &e),
        }
        Ok(())
    }

    /// Attribute write whose failure is expected on some entities (targets
    /// without an `enabled` attribute, for instance).
    pub(crate) fn attr_quiet(&mut self, path: &Path, value: &str) {
        match self.sysfs.write_attribute(path, value, false) {
            Ok(()) => self.mutations += 1,
            Err(e) => debug!(path = %path.display(), error = %e, "ignored attribute write failure"),
        }
    }

    fn note_failure(&mut self, context: &str, err: &Error) {
        warn!(context, error = %err, "operation failed, continuing");
        self.failures.push(format!("{context}: {err}"));
    }
}
