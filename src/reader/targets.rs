//! Target discovery: drivers, targets, LUN sets and initiator groups.

use std::path::Path;

use indexmap::IndexMap;

use crate::config::{DriverConfig, InitiatorGroupConfig, LunConfig, TargetConfig};
use crate::sysfs::ScstSysfs;

/// Driver directories mix attribute files with target directories; an entry
/// is a target when it carries at least one of the target-owned
/// subdirectories.
pub(crate) fn is_target_dir(sysfs: &ScstSysfs, path: &Path) -> bool {
    sysfs.is_dir(path)
        && (sysfs.exists(&path.join("luns"))
            || sysfs.exists(&path.join("ini_groups"))
            || sysfs.exists(&path.join("sessions")))
}

pub(crate) fn read_drivers(sysfs: &ScstSysfs) -> IndexMap<String, DriverConfig> {
    let mut drivers = IndexMap::new();

    for driver in sysfs.entries(&sysfs.targets_dir()) {
        let driver_dir = sysfs.driver_dir(&driver);
        if !sysfs.is_dir(&driver_dir) {
            continue;
        }
        let mut config = DriverConfig {
            name: driver.clone(),
            ..Default::default()
        };
        for entry in sysfs.entries(&driver_dir) {
            let path = driver_dir.join(&entry);
            if is_target_dir(sysfs, &path) {
                let target = read_target(sysfs, &driver, &entry);
                config.targets.insert(entry, target);
            } else if !sysfs.is_dir(&path) {
                if let Some(value) = sysfs.read_keyed_attribute(&path) {
                    config.attributes.insert(entry, value);
                }
            }
        }
        drivers.insert(driver, config);
    }

    drivers
}

fn read_target(sysfs: &ScstSysfs, driver: &str, name: &str) -> TargetConfig {
    let target_dir = sysfs.target_dir(driver, name);
    let mut target = TargetConfig {
        name: name.to_string(),
        ..Default::default()
    };

    for entry in sysfs.entries(&target_dir) {
        let path = target_dir.join(&entry);
        if sysfs.is_dir(&path) {
            continue;
        }
        if let Some(value) = sysfs.read_keyed_attribute(&path) {
            target.attributes.insert(entry, value);
        }
    }

    target.luns = read_luns(sysfs, &sysfs.luns_dir(driver, name));

    let ini_groups_dir = sysfs.ini_groups_dir(driver, name);
    for group_name in sysfs.entries(&ini_groups_dir) {
        let group_dir = ini_groups_dir.join(&group_name);
        if !sysfs.is_dir(&group_dir) {
            continue;
        }
        let mut group = InitiatorGroupConfig {
            name: group_name.clone(),
            ..Default::default()
        };
        let initiators_dir = sysfs.group_initiators_dir(driver, name, &group_name);
        for initiator in sysfs.entries(&initiators_dir) {
            if !sysfs.is_dir(&initiators_dir.join(&initiator)) {
                group.initiators.push(initiator);
            }
        }
        group.luns = read_luns(sysfs, &sysfs.group_luns_dir(driver, name, &group_name));
        for entry in sysfs.entries(&group_dir) {
            let path = group_dir.join(&entry);
            if sysfs.is_dir(&path) {
                continue;
            }
            if let Some(value) = sysfs.read_keyed_attribute(&path) {
                group.attributes.insert(entry, value);
            }
        }
        target.groups.insert(group_name, group);
    }

    target
}

/// Read a LUN set directory in ascending numeric order. LUNs whose device
/// symlink vanished mid-walk are left out; the next run re-reconciles them.
fn read_luns(sysfs: &ScstSysfs, luns_dir: &Path) -> IndexMap<u64, LunConfig> {
    let mut numbers: Vec<u64> = sysfs
        .entries(luns_dir)
        .into_iter()
        .filter_map(|name| name.parse().ok())
        .collect();
    numbers.sort_unstable();

    let mut luns = IndexMap::new();
    for number in numbers {
        let lun_dir = luns_dir.join(number.to_string());
        if !sysfs.is_dir(&lun_dir) {
            continue;
        }
        let Some(device) = sysfs.link_name(&lun_dir.join("device")) else {
            continue;
        };
        let mut lun = LunConfig::new(device);
        for attr in sysfs.entries(&lun_dir) {
            if attr == "device" {
                continue;
            }
            let attr_path = lun_dir.join(&attr);
            if sysfs.is_dir(&attr_path) {
                continue;
            }
            if let Some(value) = sysfs.read_keyed_attribute(&attr_path) {
                lun.attributes.insert(attr, value);
            }
        }
        luns.insert(number, lun);
    }
    luns
}
