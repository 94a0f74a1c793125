//! Diff / Planner
//!
//! Pure comparison of a desired model against the current model. The output
//! is a [`ConvergencePlan`]: per-subsystem Remove, Add and Update sets the
//! engine executes in its fixed phase order. Building a plan performs no
//! I/O, is deterministic, and depends only on the two models.
//!
//! Planner rules:
//! - LUN sets are diffed by LUN number. The same number with a different
//!   device yields one removal plus one assignment; the same number and
//!   device with differing attributes yields an attribute update.
//! - A device whose handler or creation-time attributes changed is planned
//!   as a removal from the old handler plus a fresh creation, and every LUN
//!   referencing it is reassigned around the recreation.
//! - The desired `enabled` state of drivers and targets is held aside in
//!   dedicated enable lists; it never appears in attribute updates.
//! - The copy-manager driver is never created or removed, and its LUN set is
//!   left to the engine's pruning phase, which must observe the live
//!   auto-populated assignments.

use indexmap::IndexMap;

use crate::config::{
    creation_params, AttrMap, DeviceGroupConfig, LunConfig, ScstConfig, TargetGroupConfig,
    COPY_MANAGER_DRIVER, ENABLED_ATTR,
};

/// Attributes the LUN management file accepts at assignment time.
const LUN_CREATE_PARAMS: &[&str] = &["read_only"];

// =============================================================================
// Plan Items
// =============================================================================

/// One LUN-to-device binding to establish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunAssignment {
    pub driver: String,
    pub target: String,
    /// Initiator group holding the LUN set; `None` for the target's default
    /// set.
    pub group: Option<String>,
    pub lun: u64,
    pub device: String,
    /// Parameters passed inside the `add` command.
    pub create_args: AttrMap,
    /// Attributes written to the LUN directory afterwards.
    pub post_attrs: AttrMap,
}

/// Attribute delta for an existing LUN whose device binding is unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunAttrUpdate {
    pub driver: String,
    pub target: String,
    pub group: Option<String>,
    pub lun: u64,
    pub attributes: AttrMap,
}

/// Entities present in the current state but absent from the desired state.
///
/// Each list is ordered for phase 1: within a list, reverse insertion order
/// of the current model; the lists themselves are executed in reverse
/// dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Removals {
    pub device_groups: Vec<String>,
    /// Devices leaving a device group that itself survives.
    pub dg_members: Vec<(String, String)>,
    /// Targets leaving a surviving target group: (group, target group, target).
    pub target_group_members: Vec<(String, String, String)>,
    /// Target groups leaving a surviving device group.
    pub target_groups: Vec<(String, String)>,
    /// (driver, target, group, lun)
    pub group_luns: Vec<(String, String, String, u64)>,
    /// Initiator groups leaving a surviving target.
    pub groups: Vec<(String, String, String)>,
    /// (driver, target, lun)
    pub target_luns: Vec<(String, String, u64)>,
    pub targets: Vec<(String, String)>,
    /// Driver attributes to reset to their defaults.
    pub driver_attributes: Vec<(String, String)>,
    /// (handler, device)
    pub devices: Vec<(String, String)>,
}

impl Removals {
    fn reverse_all(&mut self) {
        self.device_groups.reverse();
        self.dg_members.reverse();
        self.target_group_members.reverse();
        self.target_groups.reverse();
        self.group_luns.reverse();
        self.groups.reverse();
        self.target_luns.reverse();
        self.targets.reverse();
        self.driver_attributes.reverse();
        self.devices.reverse();
    }
}

/// Full change set for one convergence run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergencePlan {
    pub removals: Removals,

    // Phase 2: devices.
    pub device_creations: Vec<String>,
    pub device_updates: Vec<(String, AttrMap)>,

    // Phase 3: driver/target skeleton.
    pub target_creations: Vec<(String, String)>,
    pub target_attr_updates: Vec<(String, String, AttrMap)>,
    pub group_creations: Vec<(String, String, String)>,
    pub initiator_additions: Vec<(String, String, String, String)>,
    pub initiator_removals: Vec<(String, String, String, String)>,

    // Phase 4: LUN assignments.
    pub lun_assignments: Vec<LunAssignment>,
    pub lun_attr_updates: Vec<LunAttrUpdate>,

    // Phase 6: device groups.
    pub device_group_creations: Vec<String>,
    pub device_group_attr_updates: Vec<(String, AttrMap)>,
    pub dg_member_additions: Vec<(String, String)>,
    pub target_group_creations: Vec<(String, String)>,
    pub tg_member_additions: Vec<(String, String, String)>,
    pub tg_attr_updates: Vec<(String, String, AttrMap)>,
    pub tg_target_attr_updates: Vec<(String, String, String, AttrMap)>,

    // Phases 7-9.
    pub enable_targets: Vec<(String, String)>,
    pub enable_drivers: Vec<String>,
    pub driver_attr_updates: Vec<(String, String, String)>,
    pub scst_attr_updates: Vec<(String, String)>,
}

// =============================================================================
// Helpers
// =============================================================================

/// Desired attributes whose current value differs.
///
/// An attribute missing from the current model compares equal to a desired
/// "0": unset control-filesystem attributes read back as zero.
fn attr_delta(desired: &AttrMap, current: &AttrMap) -> AttrMap {
    let mut delta = AttrMap::new();
    for (key, want) in desired {
        match current.get(key) {
            Some(have) if have == want => {}
            None if want == "0" => {}
            _ => {
                delta.insert(key.clone(), want.clone());
            }
        }
    }
    delta
}

fn without_enabled(attrs: &AttrMap) -> AttrMap {
    attrs
        .iter()
        .filter(|(k, _)| k.as_str() != ENABLED_ATTR)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Initiator names compare with config-file escapes removed.
fn normalize_initiator(name: &str) -> String {
    name.replace('\\', "")
}

fn split_lun_attrs(attributes: &AttrMap) -> (AttrMap, AttrMap) {
    let mut create = AttrMap::new();
    let mut post = AttrMap::new();
    for (key, value) in attributes {
        if LUN_CREATE_PARAMS.contains(&key.as_str()) {
            create.insert(key.clone(), value.clone());
        } else {
            post.insert(key.clone(), value.clone());
        }
    }
    (create, post)
}

// =============================================================================
// Plan Construction
// =============================================================================

impl ConvergencePlan {
    /// Compute the change set that converges `current` to `desired`.
    pub fn build(desired: &ScstConfig, current: &ScstConfig) -> Self {
        let mut plan = ConvergencePlan::default();
        let recreated = plan.diff_devices(desired, current);
        plan.diff_drivers(desired, current, &recreated);
        plan.diff_device_groups(desired, current);
        for (key, value) in attr_delta(&desired.scst_attributes, &current.scst_attributes) {
            plan.scst_attr_updates.push((key, value));
        }
        plan.removals.reverse_all();
        plan
    }

    /// Whether the plan contains any mutation at all.
    pub fn is_empty(&self) -> bool {
        self.removals == Removals::default()
            && self.device_creations.is_empty()
            && self.device_updates.is_empty()
            && self.target_creations.is_empty()
            && self.target_attr_updates.is_empty()
            && self.group_creations.is_empty()
            && self.initiator_additions.is_empty()
            && self.initiator_removals.is_empty()
            && self.lun_assignments.is_empty()
            && self.lun_attr_updates.is_empty()
            && self.device_group_creations.is_empty()
            && self.device_group_attr_updates.is_empty()
            && self.dg_member_additions.is_empty()
            && self.target_group_creations.is_empty()
            && self.tg_member_additions.is_empty()
            && self.tg_attr_updates.is_empty()
            && self.tg_target_attr_updates.is_empty()
            && self.driver_attr_updates.is_empty()
            && self.scst_attr_updates.is_empty()
    }

    // -------------------------------------------------------------------------
    // Devices
    // -------------------------------------------------------------------------

    /// Returns the names of devices planned for recreation; their LUN
    /// references must be reassigned around the device swap.
    fn diff_devices(&mut self, desired: &ScstConfig, current: &ScstConfig) -> Vec<String> {
        let mut recreated = Vec::new();

        for (name, want) in &desired.devices {
            let Some(have) = current.devices.get(name) else {
                self.device_creations.push(name.clone());
                continue;
            };
            if have.handler != want.handler {
                self.removals
                    .devices
                    .push((have.handler.clone(), name.clone()));
                self.device_creations.push(name.clone());
                recreated.push(name.clone());
                continue;
            }

            let want_create = want.creation_attributes();
            let mut recreate = !attr_delta(&want_create, &have.attributes).is_empty();
            if !recreate {
                // A creation attribute holding a non-default value that the
                // desired config no longer mentions cannot be unset in place.
                let params = creation_params(&want.handler);
                recreate = have
                    .attributes
                    .keys()
                    .any(|key| params.contains(&key.as_str()) && !want_create.contains_key(key));
            }
            if recreate {
                self.removals
                    .devices
                    .push((have.handler.clone(), name.clone()));
                self.device_creations.push(name.clone());
                recreated.push(name.clone());
            } else {
                let delta = attr_delta(&want.post_creation_attributes(), &have.attributes);
                if !delta.is_empty() {
                    self.device_updates.push((name.clone(), delta));
                }
            }
        }

        for (name, have) in &current.devices {
            if !desired.devices.contains_key(name) {
                self.removals
                    .devices
                    .push((have.handler.clone(), name.clone()));
            }
        }

        recreated
    }

    // -------------------------------------------------------------------------
    // Drivers and targets
    // -------------------------------------------------------------------------

    fn diff_drivers(&mut self, desired: &ScstConfig, current: &ScstConfig, recreated: &[String]) {
        for (driver_name, want_driver) in &desired.drivers {
            let have_driver = current.drivers.get(driver_name);
            let is_copy_manager = driver_name == COPY_MANAGER_DRIVER;

            for (target_name, want_target) in &want_driver.targets {
                let have_target = have_driver.and_then(|d| d.targets.get(target_name));
                match have_target {
                    None if !is_copy_manager => {
                        self.target_creations
                            .push((driver_name.clone(), target_name.clone()));
                        let attrs = without_enabled(&want_target.attributes);
                        if !attrs.is_empty() {
                            self.target_attr_updates.push((
                                driver_name.clone(),
                                target_name.clone(),
                                attrs,
                            ));
                        }
                        for (lun, lun_config) in &want_target.luns {
                            self.push_assignment(driver_name, target_name, None, *lun, lun_config);
                        }
                        for (group_name, group) in &want_target.groups {
                            self.add_group(driver_name, target_name, group_name, group);
                        }
                    }
                    None => {
                        // The built-in copy-manager target is always present
                        // live even when the current model missed it.
                        for (lun, lun_config) in &want_target.luns {
                            self.push_assignment(driver_name, target_name, None, *lun, lun_config);
                        }
                    }
                    Some(have_target) => {
                        let delta = attr_delta(
                            &without_enabled(&want_target.attributes),
                            &have_target.attributes,
                        );
                        if !delta.is_empty() {
                            self.target_attr_updates.push((
                                driver_name.clone(),
                                target_name.clone(),
                                delta,
                            ));
                        }

                        self.diff_luns(
                            driver_name,
                            target_name,
                            None,
                            &want_target.luns,
                            &have_target.luns,
                            recreated,
                            is_copy_manager,
                        );

                        for (group_name, want_group) in &want_target.groups {
                            match have_target.groups.get(group_name) {
                                None => {
                                    self.add_group(driver_name, target_name, group_name, want_group)
                                }
                                Some(have_group) => {
                                    let have_normalized: Vec<String> = have_group
                                        .initiators
                                        .iter()
                                        .map(|i| normalize_initiator(i))
                                        .collect();
                                    let want_normalized: Vec<String> = want_group
                                        .initiators
                                        .iter()
                                        .map(|i| normalize_initiator(i))
                                        .collect();
                                    for initiator in &want_group.initiators {
                                        if !have_normalized
                                            .contains(&normalize_initiator(initiator))
                                        {
                                            self.initiator_additions.push((
                                                driver_name.clone(),
                                                target_name.clone(),
                                                group_name.clone(),
                                                initiator.clone(),
                                            ));
                                        }
                                    }
                                    for initiator in &have_group.initiators {
                                        if !want_normalized
                                            .contains(&normalize_initiator(initiator))
                                        {
                                            self.initiator_removals.push((
                                                driver_name.clone(),
                                                target_name.clone(),
                                                group_name.clone(),
                                                initiator.clone(),
                                            ));
                                        }
                                    }
                                    self.diff_luns(
                                        driver_name,
                                        target_name,
                                        Some(group_name),
                                        &want_group.luns,
                                        &have_group.luns,
                                        recreated,
                                        false,
                                    );
                                }
                            }
                        }
                        for group_name in have_target.groups.keys() {
                            if !want_target.groups.contains_key(group_name) {
                                self.removals.groups.push((
                                    driver_name.clone(),
                                    target_name.clone(),
                                    group_name.clone(),
                                ));
                            }
                        }
                    }
                }
            }

            if let Some(have_driver) = have_driver {
                if !is_copy_manager {
                    for target_name in have_driver.targets.keys() {
                        if !want_driver.targets.contains_key(target_name) {
                            self.removals
                                .targets
                                .push((driver_name.clone(), target_name.clone()));
                        }
                    }
                }
            }

            let want_attrs = without_enabled(&want_driver.attributes);
            let have_attrs = have_driver
                .map(|d| without_enabled(&d.attributes))
                .unwrap_or_default();
            for (key, value) in attr_delta(&want_attrs, &have_attrs) {
                self.driver_attr_updates
                    .push((driver_name.clone(), key, value));
            }
            for key in have_attrs.keys() {
                if !want_attrs.contains_key(key) {
                    self.removals
                        .driver_attributes
                        .push((driver_name.clone(), key.clone()));
                }
            }

            if want_driver.wants_enabled() {
                self.enable_drivers.push(driver_name.clone());
            }
            for (target_name, target) in &want_driver.targets {
                if target.wants_enabled() {
                    self.enable_targets
                        .push((driver_name.clone(), target_name.clone()));
                }
            }
        }

        // Targets under drivers the desired model does not mention at all.
        // The driver directories themselves are module-owned and stay.
        for (driver_name, have_driver) in &current.drivers {
            if desired.drivers.contains_key(driver_name) || driver_name == COPY_MANAGER_DRIVER {
                continue;
            }
            for target_name in have_driver.targets.keys() {
                self.removals
                    .targets
                    .push((driver_name.clone(), target_name.clone()));
            }
        }
    }

    fn add_group(
        &mut self,
        driver: &str,
        target: &str,
        group: &str,
        config: &crate::config::InitiatorGroupConfig,
    ) {
        self.group_creations
            .push((driver.to_string(), target.to_string(), group.to_string()));
        for initiator in &config.initiators {
            self.initiator_additions.push((
                driver.to_string(),
                target.to_string(),
                group.to_string(),
                initiator.clone(),
            ));
        }
        for (lun, lun_config) in &config.luns {
            self.push_assignment(driver, target, Some(group), *lun, lun_config);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn diff_luns(
        &mut self,
        driver: &str,
        target: &str,
        group: Option<&str>,
        want: &IndexMap<u64, LunConfig>,
        have: &IndexMap<u64, LunConfig>,
        recreated: &[String],
        copy_manager: bool,
    ) {
        for (number, have_lun) in have {
            let unchanged = want
                .get(number)
                .map(|w| w.device == have_lun.device && !recreated.contains(&have_lun.device))
                .unwrap_or(false);
            if !unchanged && !copy_manager {
                match group {
                    Some(g) => self.removals.group_luns.push((
                        driver.to_string(),
                        target.to_string(),
                        g.to_string(),
                        *number,
                    )),
                    None => self.removals.target_luns.push((
                        driver.to_string(),
                        target.to_string(),
                        *number,
                    )),
                }
            }
        }

        for (number, want_lun) in want {
            match have.get(number) {
                Some(have_lun)
                    if have_lun.device == want_lun.device
                        && !recreated.contains(&want_lun.device) =>
                {
                    let delta = attr_delta(&want_lun.attributes, &have_lun.attributes);
                    if !delta.is_empty() {
                        self.lun_attr_updates.push(LunAttrUpdate {
                            driver: driver.to_string(),
                            target: target.to_string(),
                            group: group.map(str::to_string),
                            lun: *number,
                            attributes: delta,
                        });
                    }
                }
                _ => self.push_assignment(driver, target, group, *number, want_lun),
            }
        }
    }

    fn push_assignment(
        &mut self,
        driver: &str,
        target: &str,
        group: Option<&str>,
        lun: u64,
        config: &LunConfig,
    ) {
        let (create_args, post_attrs) = split_lun_attrs(&config.attributes);
        self.lun_assignments.push(LunAssignment {
            driver: driver.to_string(),
            target: target.to_string(),
            group: group.map(str::to_string),
            lun,
            device: config.device.clone(),
            create_args,
            post_attrs,
        });
    }

    // -------------------------------------------------------------------------
    // Device groups
    // -------------------------------------------------------------------------

    fn diff_device_groups(&mut self, desired: &ScstConfig, current: &ScstConfig) {
        for (name, want) in &desired.device_groups {
            match current.device_groups.get(name) {
                None => self.add_device_group(name, want),
                Some(have) => {
                    let delta = attr_delta(&want.attributes, &have.attributes);
                    if !delta.is_empty() {
                        self.device_group_attr_updates.push((name.clone(), delta));
                    }
                    for device in &want.devices {
                        if !have.devices.contains(device) {
                            self.dg_member_additions.push((name.clone(), device.clone()));
                        }
                    }
                    for device in &have.devices {
                        if !want.devices.contains(device) {
                            self.removals.dg_members.push((name.clone(), device.clone()));
                        }
                    }
                    for (tg_name, want_tg) in &want.target_groups {
                        match have.target_groups.get(tg_name) {
                            None => self.add_target_group(name, tg_name, want_tg),
                            Some(have_tg) => {
                                for target in &want_tg.targets {
                                    if !have_tg.targets.contains(target) {
                                        self.tg_member_additions.push((
                                            name.clone(),
                                            tg_name.clone(),
                                            target.clone(),
                                        ));
                                    }
                                }
                                for target in &have_tg.targets {
                                    if !want_tg.targets.contains(target) {
                                        self.removals.target_group_members.push((
                                            name.clone(),
                                            tg_name.clone(),
                                            target.clone(),
                                        ));
                                    }
                                }
                                let delta = attr_delta(&want_tg.attributes, &have_tg.attributes);
                                if !delta.is_empty() {
                                    self.tg_attr_updates.push((
                                        name.clone(),
                                        tg_name.clone(),
                                        delta,
                                    ));
                                }
                                for (target, want_attrs) in &want_tg.target_attributes {
                                    let empty = AttrMap::new();
                                    let have_attrs = have_tg
                                        .target_attributes
                                        .get(target)
                                        .unwrap_or(&empty);
                                    let delta = attr_delta(want_attrs, have_attrs);
                                    if !delta.is_empty() {
                                        self.tg_target_attr_updates.push((
                                            name.clone(),
                                            tg_name.clone(),
                                            target.clone(),
                                            delta,
                                        ));
                                    }
                                }
                            }
                        }
                    }
                    for tg_name in have.target_groups.keys() {
                        if !want.target_groups.contains_key(tg_name) {
                            self.removals
                                .target_groups
                                .push((name.clone(), tg_name.clone()));
                        }
                    }
                }
            }
        }

        for name in current.device_groups.keys() {
            if !desired.device_groups.contains_key(name) {
                self.removals.device_groups.push(name.clone());
            }
        }
    }

    fn add_device_group(&mut self, name: &str, config: &DeviceGroupConfig) {
        self.device_group_creations.push(name.to_string());
        if !config.attributes.is_empty() {
            self.device_group_attr_updates
                .push((name.to_string(), config.attributes.clone()));
        }
        for device in &config.devices {
            self.dg_member_additions
                .push((name.to_string(), device.clone()));
        }
        for (tg_name, tg) in &config.target_groups {
            self.add_target_group(name, tg_name, tg);
        }
    }

    fn add_target_group(&mut self, group: &str, tg_name: &str, config: &TargetGroupConfig) {
        self.target_group_creations
            .push((group.to_string(), tg_name.to_string()));
        for target in &config.targets {
            self.tg_member_additions
                .push((group.to_string(), tg_name.to_string(), target.clone()));
        }
        if !config.attributes.is_empty() {
            self.tg_attr_updates.push((
                group.to_string(),
                tg_name.to_string(),
                config.attributes.clone(),
            ));
        }
        for (target, attrs) in &config.target_attributes {
            if !attrs.is_empty() {
                self.tg_target_attr_updates.push((
                    group.to_string(),
                    tg_name.to_string(),
                    target.clone(),
                    attrs.clone(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::ConfigParser;
    use crate::config::{DeviceConfig, DriverConfig, TargetConfig};

    fn parse(text: &str) -> ScstConfig {
        ConfigParser::new().parse_text(text).unwrap()
    }

    fn model_with_lun(device: &str, lun: u64, handler: &str) -> ScstConfig {
        let mut config = ScstConfig::default();
        let mut dev = DeviceConfig::new(device, handler);
        dev.attributes
            .insert("filename".into(), format!("/v/{device}.img"));
        config.devices.insert(device.into(), dev);
        let mut target = TargetConfig {
            name: "iqn.x:t1".into(),
            ..Default::default()
        };
        target.luns.insert(lun, LunConfig::new(device));
        let mut driver = DriverConfig {
            name: "iscsi".into(),
            ..Default::default()
        };
        driver.targets.insert("iqn.x:t1".into(), target);
        config.drivers.insert("iscsi".into(), driver);
        config
    }

    #[test]
    fn test_lun_number_swap_is_remove_plus_add() {
        // Current: LUN 0 = d1. Desired: LUN 0 = d2.
        let mut desired = model_with_lun("d2", 0, "vdisk_fileio");
        let mut d1 = DeviceConfig::new("d1", "vdisk_fileio");
        d1.attributes.insert("filename".into(), "/v/d1.img".into());
        desired.devices.insert("d1".into(), d1);

        let current = model_with_lun("d1", 0, "vdisk_fileio");

        let plan = ConvergencePlan::build(&desired, &current);
        assert_eq!(
            plan.removals.target_luns,
            vec![("iscsi".to_string(), "iqn.x:t1".to_string(), 0)]
        );
        assert_eq!(plan.lun_assignments.len(), 1);
        assert_eq!(plan.lun_assignments[0].device, "d2");
        assert_eq!(plan.lun_assignments[0].lun, 0);
        // d2 itself still needs creating.
        assert_eq!(plan.device_creations, vec!["d2".to_string()]);
    }

    #[test]
    fn test_enabled_is_held_aside() {
        let desired = parse(
            "HANDLER vdisk_fileio { DEVICE d1 { filename /v/d1.img } }\n\
             TARGET_DRIVER iscsi {\n\
               TARGET iqn.x:t1 { LUN 0 d1\n enabled 1 }\n\
               enabled 1\n\
             }\n",
        );
        let plan = ConvergencePlan::build(&desired, &ScstConfig::default());
        assert_eq!(plan.enable_drivers, vec!["iscsi".to_string()]);
        assert_eq!(
            plan.enable_targets,
            vec![("iscsi".to_string(), "iqn.x:t1".to_string())]
        );
        for (_, _, attrs) in &plan.target_attr_updates {
            assert!(!attrs.contains_key("enabled"));
        }
        assert!(plan
            .driver_attr_updates
            .iter()
            .all(|(_, attr, _)| attr != "enabled"));
    }

    #[test]
    fn test_handler_change_recreates_device_and_reassigns_luns() {
        let current = model_with_lun("d1", 0, "vdisk_fileio");
        let desired = model_with_lun("d1", 0, "vdisk_blockio");

        let plan = ConvergencePlan::build(&desired, &current);
        assert_eq!(
            plan.removals.devices,
            vec![("vdisk_fileio".to_string(), "d1".to_string())]
        );
        assert_eq!(plan.device_creations, vec!["d1".to_string()]);
        // The LUN referencing the recreated device is removed and re-added
        // even though its binding is textually identical.
        assert_eq!(
            plan.removals.target_luns,
            vec![("iscsi".to_string(), "iqn.x:t1".to_string(), 0)]
        );
        assert_eq!(plan.lun_assignments.len(), 1);
    }

    #[test]
    fn test_creation_attribute_change_forces_recreation() {
        let current = model_with_lun("d1", 0, "vdisk_fileio");
        let mut desired = current.clone();
        desired
            .devices
            .get_mut("d1")
            .unwrap()
            .attributes
            .insert("blocksize".into(), "4096".into());

        let plan = ConvergencePlan::build(&desired, &current);
        assert_eq!(plan.device_creations, vec!["d1".to_string()]);
        assert!(plan.device_updates.is_empty());
    }

    #[test]
    fn test_post_creation_attribute_change_updates_in_place() {
        let current = model_with_lun("d1", 0, "vdisk_fileio");
        let mut desired = current.clone();
        desired
            .devices
            .get_mut("d1")
            .unwrap()
            .attributes
            .insert("threads_num".into(), "8".into());

        let plan = ConvergencePlan::build(&desired, &current);
        assert!(plan.device_creations.is_empty());
        assert_eq!(plan.device_updates.len(), 1);
        assert_eq!(plan.device_updates[0].1["threads_num"], "8");
    }

    #[test]
    fn test_unset_attribute_matches_desired_zero() {
        let current = model_with_lun("d1", 0, "vdisk_fileio");
        let mut desired = current.clone();
        desired
            .devices
            .get_mut("d1")
            .unwrap()
            .attributes
            .insert("removable".into(), "0".into());

        let plan = ConvergencePlan::build(&desired, &current);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_empty_desired_tears_down_in_reverse_order() {
        let mut current = model_with_lun("d1", 0, "vdisk_fileio");
        current
            .drivers
            .get_mut("iscsi")
            .unwrap()
            .targets
            .get_mut("iqn.x:t1")
            .unwrap()
            .luns
            .insert(1, LunConfig::new("d1"));
        current.device_groups.insert(
            "dg0".into(),
            DeviceGroupConfig {
                name: "dg0".into(),
                devices: vec!["d1".into()],
                ..Default::default()
            },
        );

        let plan = ConvergencePlan::build(&ScstConfig::default(), &current);
        assert_eq!(plan.removals.device_groups, vec!["dg0".to_string()]);
        assert_eq!(
            plan.removals.targets,
            vec![("iscsi".to_string(), "iqn.x:t1".to_string())]
        );
        assert_eq!(
            plan.removals.devices,
            vec![("vdisk_fileio".to_string(), "d1".to_string())]
        );
        assert!(plan.device_creations.is_empty());
        assert!(plan.lun_assignments.is_empty());
    }

    #[test]
    fn test_copy_manager_luns_never_planned_for_removal() {
        let mut current = ScstConfig::default();
        let mut dev = DeviceConfig::new("d1", "vdisk_fileio");
        dev.attributes.insert("filename".into(), "/v/d1.img".into());
        current.devices.insert("d1".into(), dev);
        let mut cm_target = TargetConfig {
            name: "copy_manager_tgt".into(),
            ..Default::default()
        };
        cm_target.luns.insert(0, LunConfig::new("d1"));
        let mut cm = DriverConfig {
            name: "copy_manager".into(),
            ..Default::default()
        };
        cm.targets.insert("copy_manager_tgt".into(), cm_target);
        current.drivers.insert("copy_manager".into(), cm);

        let mut desired = current.clone();
        let cm_luns = &mut desired
            .drivers
            .get_mut("copy_manager")
            .unwrap()
            .targets
            .get_mut("copy_manager_tgt")
            .unwrap()
            .luns;
        cm_luns.clear();
        cm_luns.insert(2, LunConfig::new("d1"));

        let plan = ConvergencePlan::build(&desired, &current);
        // The stale assignment at LUN 0 is left for the pruning phase.
        assert!(plan.removals.target_luns.is_empty());
        assert!(plan.removals.targets.is_empty());
        assert_eq!(plan.lun_assignments.len(), 1);
        assert_eq!(plan.lun_assignments[0].lun, 2);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let desired = parse(
            "HANDLER vdisk_fileio {\n\
               DEVICE d1 { filename /v/d1.img }\n\
               DEVICE d2 { filename /v/d2.img }\n\
             }\n\
             TARGET_DRIVER iscsi {\n\
               TARGET iqn.x:t1 { LUN 0 d1\n LUN 1 d2 }\n\
             }\n",
        );
        let current = model_with_lun("d1", 0, "vdisk_fileio");
        let first = ConvergencePlan::build(&desired, &current);
        let second = ConvergencePlan::build(&desired, &current);
        assert_eq!(first, second);
    }

    #[test]
    fn test_obsolete_driver_attribute_reset() {
        let mut current = ScstConfig::default();
        let mut driver = DriverConfig {
            name: "iscsi".into(),
            ..Default::default()
        };
        driver
            .attributes
            .insert("iSNSServer".into(), "10.0.0.9".into());
        current.drivers.insert("iscsi".into(), driver);

        let mut desired = ScstConfig::default();
        desired.drivers.insert(
            "iscsi".into(),
            DriverConfig {
                name: "iscsi".into(),
                ..Default::default()
            },
        );

        let plan = ConvergencePlan::build(&desired, &current);
        assert_eq!(
            plan.removals.driver_attributes,
            vec![("iscsi".to_string(), "iSNSServer".to_string())]
        );
    }
}
