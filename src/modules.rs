//! Kernel Module Management
//!
//! Maps a configuration to the kernel modules it needs and asks the loader
//! collaborator to bring them in before any mutation. The policy is a static
//! table: handler and driver names map to module names, plus optional
//! CRC-acceleration modules when the iSCSI driver is in play (with an
//! x86-only hardware variant).
//!
//! A required module that fails to load aborts the run; an optional one is
//! logged and skipped.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ScstConfig;
use crate::error::{Error, Result};

// =============================================================================
// Policy Tables
// =============================================================================

/// Core module backing the control filesystem itself.
const CORE_MODULE: &str = "scst";

const HANDLER_MODULES: &[(&str, &str)] = &[
    ("dev_cdrom", "scst_cdrom"),
    ("dev_changer", "scst_changer"),
    ("dev_disk", "scst_disk"),
    ("dev_disk_perf", "scst_disk"),
    ("dev_modisk", "scst_modisk"),
    ("dev_modisk_perf", "scst_modisk"),
    ("dev_processor", "scst_processor"),
    ("dev_raid", "scst_raid"),
    ("dev_tape", "scst_tape"),
    ("dev_tape_perf", "scst_tape"),
    ("dev_user", "scst_user"),
    ("vdisk_blockio", "scst_vdisk"),
    ("vdisk_fileio", "scst_vdisk"),
    ("vdisk_nullio", "scst_vdisk"),
    ("vcdrom", "scst_vdisk"),
];

/// Driver module table. The copy-manager driver is built into the core and
/// needs nothing.
const DRIVER_MODULES: &[(&str, &str)] = &[("iscsi", "iscsi_scst"), ("qla2x00t", "qla2x00tgt")];

/// CRC modules the iSCSI driver benefits from; absence is tolerated.
const ISCSI_OPTIONAL_MODULES: &[&str] = &["crc32c"];

/// Hardware CRC acceleration available on x86-family hosts only.
const ISCSI_X86_MODULES: &[&str] = &["crc32c-intel"];

const MODPROBE_TIMEOUT: Duration = Duration::from_secs(30);
const MODPROBE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One module requirement derived from the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: String,
    pub optional: bool,
}

impl ModuleSpec {
    fn required(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
        }
    }

    fn optional(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: true,
        }
    }
}

// =============================================================================
// Loader Collaborator
// =============================================================================

/// Loads one kernel module; the configurator consumes only the outcome.
pub trait ModuleLoader {
    fn load(&self, name: &str, optional: bool) -> std::result::Result<(), String>;
}

/// Loader that shells out to `modprobe`, skipping modules already visible
/// under `/sys/module`.
pub struct ModprobeLoader {
    module_root: PathBuf,
}

impl Default for ModprobeLoader {
    fn default() -> Self {
        Self {
            module_root: PathBuf::from("/sys/module"),
        }
    }
}

impl ModprobeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Modules with hyphens appear under `/sys/module` with underscores, and
    /// crc32c is satisfied by any of its implementations.
    fn is_loaded(&self, name: &str) -> bool {
        if name == "crc32c" {
            return ["crc32c_intel", "crc32c_generic", "libcrc32c"]
                .iter()
                .any(|candidate| self.module_root.join(candidate).exists());
        }
        self.module_root.join(name.replace('-', "_")).exists()
    }
}

impl ModuleLoader for ModprobeLoader {
    fn load(&self, name: &str, optional: bool) -> std::result::Result<(), String> {
        if self.is_loaded(name) {
            debug!(module = name, "module already loaded");
            return Ok(());
        }

        let mut child = Command::new("modprobe")
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("cannot run modprobe: {e}"))?;

        let deadline = Instant::now() + MODPROBE_TIMEOUT;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        return Err("modprobe timed out".to_string());
                    }
                    std::thread::sleep(MODPROBE_POLL_INTERVAL);
                }
                Err(e) => return Err(format!("waiting for modprobe: {e}")),
            }
        };

        if status.success() {
            info!(module = name, "module loaded");
            Ok(())
        } else {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                use std::io::Read;
                let _ = pipe.read_to_string(&mut stderr);
            }
            let reason = if stderr.trim().is_empty() {
                format!("modprobe exited with {status}")
            } else {
                stderr.trim().to_string()
            };
            if optional {
                debug!(module = name, %reason, "optional module unavailable");
            }
            Err(reason)
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Computes the module requirements of a configuration and drives the
/// loader.
pub struct ModuleManager {
    loader: Box<dyn ModuleLoader>,
}

impl ModuleManager {
    pub fn new(loader: Box<dyn ModuleLoader>) -> Self {
        Self { loader }
    }

    pub fn with_modprobe() -> Self {
        Self::new(Box::new(ModprobeLoader::new()))
    }

    /// Union of modules the configuration needs, in deterministic order.
    pub fn required_modules(config: &ScstConfig) -> Vec<ModuleSpec> {
        Self::required_modules_for(
            config,
            cfg!(any(target_arch = "x86_64", target_arch = "x86")),
        )
    }

    fn required_modules_for(config: &ScstConfig, x86: bool) -> Vec<ModuleSpec> {
        let mut specs = vec![ModuleSpec::required(CORE_MODULE)];
        let mut push = |spec: ModuleSpec, specs: &mut Vec<ModuleSpec>| {
            if !specs.iter().any(|s| s.name == spec.name) {
                specs.push(spec);
            }
        };

        for handler in config.handlers.keys() {
            if let Some((_, module)) = HANDLER_MODULES.iter().find(|(h, _)| h == handler) {
                push(ModuleSpec::required(module), &mut specs);
            }
        }
        for driver in config.drivers.keys() {
            if let Some((_, module)) = DRIVER_MODULES.iter().find(|(d, _)| d == driver) {
                push(ModuleSpec::required(module), &mut specs);
            }
        }
        if config.drivers.contains_key("iscsi") {
            for module in ISCSI_OPTIONAL_MODULES {
                push(ModuleSpec::optional(module), &mut specs);
            }
            if x86 {
                for module in ISCSI_X86_MODULES {
                    push(ModuleSpec::optional(module), &mut specs);
                }
            }
        }
        specs
    }

    /// Load everything the configuration needs. Optional failures are logged
    /// and skipped; a required failure aborts before any mutation.
    pub fn ensure_loaded(&self, config: &ScstConfig) -> Result<()> {
        let specs = Self::required_modules(config);
        debug!(
            modules = ?specs.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "required kernel modules"
        );
        for spec in specs {
            if let Err(reason) = self.loader.load(&spec.name, spec.optional) {
                if spec.optional {
                    warn!(module = %spec.name, %reason, "optional module skipped");
                } else {
                    return Err(Error::ModuleLoad {
                        module: spec.name,
                        reason,
                    });
                }
            }
        }
        Ok(())
    }
}
