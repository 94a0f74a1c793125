//! Device phase: `add_device`/`del_device` commands and device attribute
//! writes.

use super::ConvergenceEngine;
use crate::config::{DeviceConfig, ScstConfig};
use crate::error::Result;
use crate::plan::ConvergencePlan;

impl ConvergenceEngine {
    pub(crate) fn phase_devices(
        &mut self,
        desired: &ScstConfig,
        plan: &ConvergencePlan,
    ) -> Result<()> {
        for name in &plan.device_creations {
            let device = &desired.devices[name.as_str()];
            self.create_device(device)?;
        }
        for (name, attrs) in &plan.device_updates {
            let device = &desired.devices[name.as_str()];
            for (attr, value) in attrs {
                let path = self.sysfs.device_dir(&device.handler, name).join(attr);
                self.attr_logged(
                    &path,
                    value,
                    &format!("set device attribute {name}.{attr}"),
                )?;
            }
        }
        Ok(())
    }

    /// Creation happens in two steps: the `add_device` command carries the
    /// creation-time parameters, everything else is written to the device
    /// directory afterwards.
    fn create_device(&mut self, device: &DeviceConfig) -> Result<()> {
        let mut params: Vec<String> = Vec::new();
        let mut cluster_mode = None;
        for (key, value) in device.creation_attributes() {
            if key == "cluster_mode" {
                // cluster_mode must follow t10_dev_id in the command.
                cluster_mode = Some(value);
            } else {
                params.push(format!("{key}={value}"));
            }
        }
        if let Some(value) = cluster_mode {
            params.push(format!("cluster_mode={value}"));
        }

        let command = if params.is_empty() {
            format!("add_device {}", device.name)
        } else {
            format!("add_device {} {}", device.name, params.join(";"))
        };
        let mgmt = self.sysfs.handler_mgmt(&device.handler);
        self.mgmt_fatal(&mgmt, &command)?;

        for (attr, value) in device.post_creation_attributes() {
            let path = self
                .sysfs
                .device_dir(&device.handler, &device.name)
                .join(&attr);
            self.attr_logged(
                &path,
                &value,
                &format!("set device attribute {}.{attr}", device.name),
            )?;
        }
        Ok(())
    }

    pub(crate) fn remove_device(&mut self, handler: &str, device: &str) -> Result<()> {
        let mgmt = self.sysfs.handler_mgmt(handler);
        self.mgmt_logged(
            &mgmt,
            &format!("del_device {device}"),
            &format!("remove device {device} from handler {handler}"),
        )
    }
}
