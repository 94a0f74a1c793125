//! Device discovery: handlers and the devices below them.

use indexmap::IndexMap;

use crate::config::{DeviceConfig, HandlerConfig};
use crate::sysfs::ScstSysfs;

/// Walk `handlers/` and collect handler attributes plus one [`DeviceConfig`]
/// per device directory. Subdirectories of a device (`handler`, `exported`)
/// are metadata, not attributes.
pub(crate) fn read_handlers_and_devices(
    sysfs: &ScstSysfs,
) -> (IndexMap<String, HandlerConfig>, IndexMap<String, DeviceConfig>) {
    let mut handlers = IndexMap::new();
    let mut devices = IndexMap::new();

    for handler in sysfs.entries(&sysfs.handlers_dir()) {
        let handler_dir = sysfs.handler_dir(&handler);
        if !sysfs.is_dir(&handler_dir) {
            continue;
        }
        let mut handler_config = HandlerConfig::default();
        for entry in sysfs.entries(&handler_dir) {
            let path = handler_dir.join(&entry);
            if sysfs.is_dir(&path) {
                let mut device = DeviceConfig::new(entry.clone(), handler.clone());
                for attr in sysfs.entries(&path) {
                    let attr_path = path.join(&attr);
                    if sysfs.is_dir(&attr_path) {
                        continue;
                    }
                    if let Some(value) = sysfs.read_keyed_attribute(&attr_path) {
                        device.attributes.insert(attr, value);
                    }
                }
                devices.insert(entry, device);
            } else if let Some(value) = sysfs.read_keyed_attribute(&path) {
                handler_config.attributes.insert(entry, value);
            }
        }
        handlers.insert(handler, handler_config);
    }

    (handlers, devices)
}
