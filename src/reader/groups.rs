//! Device-group discovery: ALUA device groups with their target groups.

use indexmap::IndexMap;

use crate::config::{AttrMap, DeviceGroupConfig, TargetGroupConfig};
use crate::sysfs::ScstSysfs;

pub(crate) fn read_device_groups(sysfs: &ScstSysfs) -> IndexMap<String, DeviceGroupConfig> {
    let mut groups = IndexMap::new();

    for group_name in sysfs.entries(&sysfs.device_groups_dir()) {
        let group_dir = sysfs.device_group_dir(&group_name);
        if !sysfs.is_dir(&group_dir) {
            continue;
        }
        let mut group = DeviceGroupConfig {
            name: group_name.clone(),
            ..Default::default()
        };

        group.devices = sysfs.entries(&sysfs.dg_devices_dir(&group_name));

        let target_groups_dir = sysfs.dg_target_groups_dir(&group_name);
        for tg_name in sysfs.entries(&target_groups_dir) {
            let tg_dir = target_groups_dir.join(&tg_name);
            if !sysfs.is_dir(&tg_dir) {
                continue;
            }
            let mut tg = TargetGroupConfig {
                name: tg_name.clone(),
                ..Default::default()
            };
            for entry in sysfs.entries(&tg_dir) {
                let path = tg_dir.join(&entry);
                if sysfs.is_dir(&path) {
                    // Targets with per-target attributes appear as
                    // directories.
                    let mut attrs = AttrMap::new();
                    for attr in sysfs.entries(&path) {
                        if let Some(value) = sysfs.read_keyed_attribute(&path.join(&attr)) {
                            attrs.insert(attr, value);
                        }
                    }
                    if !attrs.is_empty() {
                        tg.target_attributes.insert(entry.clone(), attrs);
                    }
                    tg.targets.push(entry);
                } else if sysfs.link_name(&path).is_some() {
                    // Attribute-less targets are plain symlinks.
                    tg.targets.push(entry);
                } else if let Some(value) = sysfs.read_keyed_attribute(&path) {
                    tg.attributes.insert(entry, value);
                }
            }
            group.target_groups.insert(tg_name, tg);
        }

        groups.insert(group_name, group);
    }

    groups
}
