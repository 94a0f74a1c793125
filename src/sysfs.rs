//! Control Filesystem Adapter
//!
//! Low-level interface to the SCST sysfs tree. The adapter performs
//! attribute reads and writes, management-file commands and result
//! verification against the subsystem's `last_sysfs_mgmt_res` attribute,
//! with one configurable timeout per operation.
//!
//! Filesystem primitives sit behind the [`ControlFs`] trait so the
//! convergence engine can run against an in-memory subsystem in tests; the
//! production backend is [`DiskFs`]. The adapter itself never caches reads.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Default root of the SCST control filesystem.
pub const DEFAULT_ROOT: &str = "/sys/kernel/scst_tgt";

/// Default per-operation timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Management file name used throughout the tree.
pub const MGMT_FILE: &str = "mgmt";

/// Verification attribute under the subsystem root: "0" on success.
pub const RESULT_ATTR: &str = "last_sysfs_mgmt_res";

/// Global I/O suspension toggle under the subsystem root.
pub const SUSPEND_ATTR: &str = "suspend";

/// Marker the subsystem appends to attributes holding non-default values.
const KEY_MARKER: &str = "[key]";

const SUCCESS_RESULT: &str = "0";
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Filesystem Backend
// =============================================================================

/// Filesystem primitives the adapter is built on.
pub trait ControlFs {
    fn read(&self, path: &Path) -> io::Result<String>;
    fn write(&self, path: &Path, data: &str) -> io::Result<()>;
    /// Directory entries, dotfiles excluded; empty when unreadable.
    fn list(&self, path: &Path) -> Vec<String>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    /// Final component of a symlink target, if `path` is a symlink.
    fn link_name(&self, path: &Path) -> Option<String>;
}

/// Real sysfs backend.
pub struct DiskFs;

impl ControlFs for DiskFs {
    fn read(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write(&self, path: &Path, data: &str) -> io::Result<()> {
        use io::Write;
        // Never create: sysfs attributes exist or the write is invalid.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)?;
        file.write_all(data.as_bytes())
    }

    fn list(&self, path: &Path) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(path) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();
        names
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn link_name(&self, path: &Path) -> Option<String> {
        let target = std::fs::read_link(path).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// SCST sysfs adapter rooted at one control filesystem tree.
pub struct ScstSysfs {
    fs: Box<dyn ControlFs>,
    root: PathBuf,
    timeout: Duration,
}

impl ScstSysfs {
    /// Adapter over the real filesystem.
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::with_backend(Box::new(DiskFs), root, timeout)
    }

    /// Adapter over an arbitrary backend.
    pub fn with_backend(fs: Box<dyn ControlFs>, root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            fs,
            root: root.into(),
            timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the subsystem root is present.
    pub fn available(&self) -> bool {
        self.fs.is_dir(&self.root)
    }

    // -------------------------------------------------------------------------
    // Fixed paths
    // -------------------------------------------------------------------------

    pub fn result_path(&self) -> PathBuf {
        self.root.join(RESULT_ATTR)
    }

    pub fn suspend_path(&self) -> PathBuf {
        self.root.join(SUSPEND_ATTR)
    }

    pub fn handlers_dir(&self) -> PathBuf {
        self.root.join("handlers")
    }

    pub fn handler_dir(&self, handler: &str) -> PathBuf {
        self.handlers_dir().join(handler)
    }

    pub fn handler_mgmt(&self, handler: &str) -> PathBuf {
        self.handler_dir(handler).join(MGMT_FILE)
    }

    pub fn device_dir(&self, handler: &str, device: &str) -> PathBuf {
        self.handler_dir(handler).join(device)
    }

    pub fn targets_dir(&self) -> PathBuf {
        self.root.join("targets")
    }

    pub fn driver_dir(&self, driver: &str) -> PathBuf {
        self.targets_dir().join(driver)
    }

    pub fn driver_mgmt(&self, driver: &str) -> PathBuf {
        self.driver_dir(driver).join(MGMT_FILE)
    }

    pub fn target_dir(&self, driver: &str, target: &str) -> PathBuf {
        self.driver_dir(driver).join(target)
    }

    pub fn luns_dir(&self, driver: &str, target: &str) -> PathBuf {
        self.target_dir(driver, target).join("luns")
    }

    pub fn luns_mgmt(&self, driver: &str, target: &str) -> PathBuf {
        self.luns_dir(driver, target).join(MGMT_FILE)
    }

    pub fn lun_dir(&self, driver: &str, target: &str, lun: u64) -> PathBuf {
        self.luns_dir(driver, target).join(lun.to_string())
    }

    pub fn ini_groups_dir(&self, driver: &str, target: &str) -> PathBuf {
        self.target_dir(driver, target).join("ini_groups")
    }

    pub fn ini_groups_mgmt(&self, driver: &str, target: &str) -> PathBuf {
        self.ini_groups_dir(driver, target).join(MGMT_FILE)
    }

    pub fn ini_group_dir(&self, driver: &str, target: &str, group: &str) -> PathBuf {
        self.ini_groups_dir(driver, target).join(group)
    }

    pub fn group_luns_dir(&self, driver: &str, target: &str, group: &str) -> PathBuf {
        self.ini_group_dir(driver, target, group).join("luns")
    }

    pub fn group_luns_mgmt(&self, driver: &str, target: &str, group: &str) -> PathBuf {
        self.group_luns_dir(driver, target, group).join(MGMT_FILE)
    }

    pub fn group_initiators_dir(&self, driver: &str, target: &str, group: &str) -> PathBuf {
        self.ini_group_dir(driver, target, group).join("initiators")
    }

    pub fn group_initiators_mgmt(&self, driver: &str, target: &str, group: &str) -> PathBuf {
        self.group_initiators_dir(driver, target, group).join(MGMT_FILE)
    }

    pub fn device_groups_dir(&self) -> PathBuf {
        self.root.join("device_groups")
    }

    pub fn device_groups_mgmt(&self) -> PathBuf {
        self.device_groups_dir().join(MGMT_FILE)
    }

    pub fn device_group_dir(&self, group: &str) -> PathBuf {
        self.device_groups_dir().join(group)
    }

    pub fn dg_devices_dir(&self, group: &str) -> PathBuf {
        self.device_group_dir(group).join("devices")
    }

    pub fn dg_devices_mgmt(&self, group: &str) -> PathBuf {
        self.dg_devices_dir(group).join(MGMT_FILE)
    }

    pub fn dg_target_groups_dir(&self, group: &str) -> PathBuf {
        self.device_group_dir(group).join("target_groups")
    }

    pub fn dg_target_groups_mgmt(&self, group: &str) -> PathBuf {
        self.dg_target_groups_dir(group).join(MGMT_FILE)
    }

    pub fn dg_target_group_dir(&self, group: &str, target_group: &str) -> PathBuf {
        self.dg_target_groups_dir(group).join(target_group)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Read a file verbatim.
    pub fn read_raw(&self, path: &Path) -> Result<String> {
        self.fs
            .read(path)
            .map_err(|e| Error::operation(path, e.to_string()))
    }

    /// Read a single attribute value.
    ///
    /// Trailing whitespace is stripped, and one trailing `[key]` marker (the
    /// subsystem's tag for non-default values) is removed. A second marker is
    /// left alone: it is part of the value.
    pub fn read_attribute(&self, path: &Path) -> Result<String> {
        let raw = self.read_raw(path)?;
        let trimmed = raw.trim_end();
        match trimmed.strip_suffix(KEY_MARKER) {
            Some(value) => Ok(value.trim_end().to_string()),
            None => Ok(trimmed.to_string()),
        }
    }

    /// Read an attribute only if it holds a non-default value.
    ///
    /// Returns `Some(value)` when the `[key]` marker is present, `None` for
    /// default or unreadable attributes. The state reader builds the current
    /// model exclusively from keyed attributes so the planner never rewrites
    /// defaults.
    pub fn read_keyed_attribute(&self, path: &Path) -> Option<String> {
        let raw = self.fs.read(path).ok()?;
        let trimmed = raw.trim_end();
        trimmed
            .strip_suffix(KEY_MARKER)
            .map(|value| value.trim_end().to_string())
    }

    pub fn list_dir(&self, path: &Path) -> Vec<String> {
        self.fs.list(path)
    }

    /// Directory entries with the management file filtered out.
    pub fn entries(&self, path: &Path) -> Vec<String> {
        self.fs
            .list(path)
            .into_iter()
            .filter(|name| name != MGMT_FILE)
            .collect()
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        self.fs.is_dir(path)
    }

    pub fn link_name(&self, path: &Path) -> Option<String> {
        self.fs.link_name(path)
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Write one attribute value. With `verify`, the management result
    /// attribute is consulted afterwards and a non-success status fails the
    /// write.
    pub fn write_attribute(&self, path: &Path, value: &str, verify: bool) -> Result<()> {
        self.write_checked(path, value, verify)
    }

    /// Submit a command line to a management file.
    pub fn submit_management(&self, mgmt_path: &Path, command: &str, verify: bool) -> Result<()> {
        self.write_checked(mgmt_path, command, verify)
    }

    fn write_checked(&self, path: &Path, data: &str, verify: bool) -> Result<()> {
        debug!(path = %path.display(), data, "control write");
        match self.fs.write(path, data) {
            Ok(()) => {
                if verify {
                    self.check_result(path)
                } else {
                    Ok(())
                }
            }
            // The subsystem signals an operation still in flight with EAGAIN.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if verify {
                    self.wait_for_completion(path)
                } else {
                    Ok(())
                }
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Err(Error::operation(path, "permission denied"))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::operation(path, "no such attribute"))
            }
            Err(e) => Err(Error::operation(path, e.to_string())),
        }
    }

    fn check_result(&self, op_path: &Path) -> Result<()> {
        let result_path = self.result_path();
        if !self.fs.exists(&result_path) {
            return Ok(());
        }
        let result = self.read_raw(&result_path)?;
        let result = result.trim();
        if result == SUCCESS_RESULT {
            Ok(())
        } else {
            Err(Error::operation(
                op_path,
                format!("subsystem reported: {result}"),
            ))
        }
    }

    fn wait_for_completion(&self, op_path: &Path) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.check_result(op_path).is_ok() {
                return Ok(());
            }
            if start.elapsed() >= self.timeout {
                return Err(Error::Timeout {
                    path: op_path.to_path_buf(),
                    seconds: self.timeout.as_secs(),
                });
            }
            std::thread::sleep(RESULT_POLL_INTERVAL);
        }
    }
}

// =============================================================================
// Mock subsystem (test backend)
// =============================================================================

/// In-memory control filesystem that emulates the side effects of SCST
/// management commands: entity directories appear and disappear, attribute
/// writes are tagged with the `[key]` marker, and device creation
/// auto-populates the copy-manager target with a LUN per device.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    pub const ROOT: &str = "/scst";

    #[derive(Debug, Clone)]
    enum Node {
        Dir,
        File(String),
        Link(String),
    }

    #[derive(Default)]
    struct Inner {
        nodes: RefCell<BTreeMap<String, Node>>,
        journal: RefCell<Vec<(String, String)>>,
        fail_on: RefCell<Vec<String>>,
    }

    #[derive(Clone, Default)]
    pub struct MockScst {
        inner: Rc<Inner>,
    }

    impl MockScst {
        pub fn new() -> Self {
            let mock = Self::default();
            {
                let mut nodes = mock.inner.nodes.borrow_mut();
                for dir in [
                    ROOT.to_string(),
                    format!("{ROOT}/handlers"),
                    format!("{ROOT}/handlers/vdisk_fileio"),
                    format!("{ROOT}/handlers/vdisk_blockio"),
                    format!("{ROOT}/handlers/dev_disk"),
                    format!("{ROOT}/targets"),
                    format!("{ROOT}/targets/iscsi"),
                    format!("{ROOT}/targets/copy_manager"),
                    format!("{ROOT}/targets/copy_manager/copy_manager_tgt"),
                    format!("{ROOT}/targets/copy_manager/copy_manager_tgt/luns"),
                    format!("{ROOT}/device_groups"),
                ] {
                    nodes.insert(dir, Node::Dir);
                }
                let help = "Usage: echo \"command\" >mgmt".to_string();
                for file in [
                    format!("{ROOT}/handlers/vdisk_fileio/{MGMT_FILE}"),
                    format!("{ROOT}/handlers/vdisk_blockio/{MGMT_FILE}"),
                    format!("{ROOT}/handlers/dev_disk/{MGMT_FILE}"),
                    format!("{ROOT}/targets/iscsi/{MGMT_FILE}"),
                    format!("{ROOT}/targets/copy_manager/copy_manager_tgt/luns/{MGMT_FILE}"),
                    format!("{ROOT}/device_groups/{MGMT_FILE}"),
                ] {
                    nodes.insert(file, Node::File(help.clone()));
                }
                nodes.insert(
                    format!("{ROOT}/targets/iscsi/enabled"),
                    Node::File("0".into()),
                );
                nodes.insert(format!("{ROOT}/{RESULT_ATTR}"), Node::File("0".into()));
                nodes.insert(format!("{ROOT}/{SUSPEND_ATTR}"), Node::File("0".into()));
            }
            mock
        }

        /// Adapter over a clone of this mock, rooted at [`ROOT`].
        pub fn sysfs(&self) -> ScstSysfs {
            ScstSysfs::with_backend(Box::new(self.clone()), ROOT, Duration::from_secs(5))
        }

        /// Make writes to paths containing `fragment` fail.
        pub fn fail_on(&self, fragment: &str) {
            self.inner.fail_on.borrow_mut().push(fragment.to_string());
        }

        /// All successful writes, in order.
        pub fn writes(&self) -> Vec<(String, String)> {
            self.inner.journal.borrow().clone()
        }

        pub fn write_count(&self) -> usize {
            self.inner.journal.borrow().len()
        }

        pub fn clear_journal(&self) {
            self.inner.journal.borrow_mut().clear();
        }

        /// Seed a file without touching the journal.
        pub fn set_file(&self, path: &str, content: &str) {
            self.inner
                .nodes
                .borrow_mut()
                .insert(format!("{ROOT}/{path}"), Node::File(content.into()));
        }

        pub fn has_node(&self, path: &str) -> bool {
            self.inner
                .nodes
                .borrow()
                .contains_key(&format!("{ROOT}/{path}"))
        }

        pub fn file_content(&self, path: &str) -> Option<String> {
            match self.inner.nodes.borrow().get(&format!("{ROOT}/{path}")) {
                Some(Node::File(content)) => Some(content.clone()),
                _ => None,
            }
        }

        fn set_result(&self, result: &str) {
            self.inner
                .nodes
                .borrow_mut()
                .insert(format!("{ROOT}/{RESULT_ATTR}"), Node::File(result.into()));
        }

        fn children(&self, dir: &str) -> Vec<String> {
            let prefix = format!("{dir}/");
            self.inner
                .nodes
                .borrow()
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(str::to_string)
                .collect()
        }

        fn remove_tree(&self, path: &str) {
            let prefix = format!("{path}/");
            let mut nodes = self.inner.nodes.borrow_mut();
            nodes.remove(path);
            nodes.retain(|key, _| !key.starts_with(&prefix));
        }

        fn insert_dir(&self, path: String) {
            self.inner.nodes.borrow_mut().insert(path, Node::Dir);
        }

        fn insert_file(&self, path: String, content: &str) {
            self.inner
                .nodes
                .borrow_mut()
                .insert(path, Node::File(content.into()));
        }

        fn insert_link(&self, path: String, target: &str) {
            self.inner
                .nodes
                .borrow_mut()
                .insert(path, Node::Link(target.into()));
        }

        fn add_lun(&self, luns_dir: &str, device: &str, lun: &str, params: &str) {
            self.insert_dir(format!("{luns_dir}/{lun}"));
            self.insert_link(format!("{luns_dir}/{lun}/device"), device);
            for param in params.split(';').filter(|p| !p.is_empty()) {
                if let Some((key, value)) = param.split_once('=') {
                    self.insert_file(
                        format!("{luns_dir}/{lun}/{key}"),
                        &format!("{value}\n{KEY_MARKER}"),
                    );
                }
            }
        }

        /// Auto-populate the copy-manager target with the new device at the
        /// lowest free slot, as the subsystem does on device creation.
        fn auto_copy_manager_lun(&self, device: &str) {
            let luns_dir = format!("{ROOT}/targets/copy_manager/copy_manager_tgt/luns");
            let taken: Vec<u64> = self
                .children(&luns_dir)
                .into_iter()
                .filter_map(|name| name.parse().ok())
                .collect();
            let mut slot = 0u64;
            while taken.contains(&slot) {
                slot += 1;
            }
            self.add_lun(&luns_dir, device, &slot.to_string(), "");
        }

        fn drop_copy_manager_luns(&self, device: &str) {
            let luns_dir = format!("{ROOT}/targets/copy_manager/copy_manager_tgt/luns");
            for lun in self.children(&luns_dir) {
                if lun == MGMT_FILE {
                    continue;
                }
                let link = format!("{luns_dir}/{lun}/device");
                let points_here = matches!(
                    self.inner.nodes.borrow().get(&link),
                    Some(Node::Link(target)) if target == device
                );
                if points_here {
                    self.remove_tree(&format!("{luns_dir}/{lun}"));
                }
            }
        }

        fn clear_dir_keep_mgmt(&self, dir: &str) {
            for entry in self.children(dir) {
                if entry != MGMT_FILE {
                    self.remove_tree(&format!("{dir}/{entry}"));
                }
            }
        }

        fn apply_mgmt(&self, mgmt_path: &str, command: &str) {
            let relative = mgmt_path
                .strip_prefix(&format!("{ROOT}/"))
                .unwrap_or(mgmt_path);
            let segments: Vec<&str> = relative.split('/').collect();
            let parent = mgmt_path.trim_end_matches(&format!("/{MGMT_FILE}")).to_string();
            let words: Vec<&str> = command.split_whitespace().collect();
            let Some(&verb) = words.first() else {
                self.set_result("-22");
                return;
            };

            match segments.as_slice() {
                ["handlers", handler, MGMT_FILE] => match verb {
                    "add_device" if words.len() >= 2 => {
                        let device = words[1];
                        let device_dir = format!("{ROOT}/handlers/{handler}/{device}");
                        self.insert_dir(device_dir.clone());
                        let params = words.get(2..).map(|w| w.join(" ")).unwrap_or_default();
                        for param in params.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                            if let Some((key, value)) = param.split_once('=') {
                                self.insert_file(
                                    format!("{device_dir}/{key}"),
                                    &format!("{value}\n{KEY_MARKER}"),
                                );
                            }
                        }
                        self.auto_copy_manager_lun(device);
                        self.set_result("0");
                    }
                    "del_device" if words.len() == 2 => {
                        let device = words[1];
                        self.remove_tree(&format!("{ROOT}/handlers/{handler}/{device}"));
                        self.drop_copy_manager_luns(device);
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                ["targets", driver, MGMT_FILE] => match verb {
                    "add_target" if words.len() >= 2 => {
                        let target_dir = format!("{ROOT}/targets/{driver}/{}", words[1]);
                        self.insert_dir(target_dir.clone());
                        self.insert_dir(format!("{target_dir}/luns"));
                        self.insert_file(format!("{target_dir}/luns/{MGMT_FILE}"), "");
                        self.insert_dir(format!("{target_dir}/ini_groups"));
                        self.insert_file(format!("{target_dir}/ini_groups/{MGMT_FILE}"), "");
                        self.insert_file(format!("{target_dir}/enabled"), "0");
                        self.set_result("0");
                    }
                    "del_target" if words.len() == 2 => {
                        self.remove_tree(&format!("{ROOT}/targets/{driver}/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                [.., "luns", MGMT_FILE] => match verb {
                    "add" | "replace" if words.len() >= 3 => {
                        let device = words[1];
                        let lun = words[2];
                        if verb == "replace" {
                            self.remove_tree(&format!("{parent}/{lun}"));
                        }
                        let params = words.get(3..).map(|w| w.join(" ")).unwrap_or_default();
                        self.add_lun(&parent, device, lun, &params);
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        if self.has_node(
                            format!("{parent}/{}", words[1])
                                .strip_prefix(&format!("{ROOT}/"))
                                .unwrap(),
                        ) {
                            self.remove_tree(&format!("{parent}/{}", words[1]));
                            self.set_result("0");
                        } else {
                            self.set_result("-19");
                        }
                    }
                    "clear" => {
                        self.clear_dir_keep_mgmt(&parent);
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                [.., "ini_groups", MGMT_FILE] => match verb {
                    "create" if words.len() == 2 => {
                        let group_dir = format!("{parent}/{}", words[1]);
                        self.insert_dir(group_dir.clone());
                        self.insert_dir(format!("{group_dir}/luns"));
                        self.insert_file(format!("{group_dir}/luns/{MGMT_FILE}"), "");
                        self.insert_dir(format!("{group_dir}/initiators"));
                        self.insert_file(format!("{group_dir}/initiators/{MGMT_FILE}"), "");
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                [.., "initiators", MGMT_FILE] => match verb {
                    "add" if words.len() == 2 => {
                        self.insert_file(format!("{parent}/{}", words[1]), "");
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    "clear" => {
                        self.clear_dir_keep_mgmt(&parent);
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                ["device_groups", MGMT_FILE] => match verb {
                    "create" if words.len() == 2 => {
                        let group_dir = format!("{ROOT}/device_groups/{}", words[1]);
                        self.insert_dir(group_dir.clone());
                        self.insert_dir(format!("{group_dir}/devices"));
                        self.insert_file(format!("{group_dir}/devices/{MGMT_FILE}"), "");
                        self.insert_dir(format!("{group_dir}/target_groups"));
                        self.insert_file(format!("{group_dir}/target_groups/{MGMT_FILE}"), "");
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{ROOT}/device_groups/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                [.., "devices", MGMT_FILE] => match verb {
                    "add" if words.len() == 2 => {
                        self.insert_link(format!("{parent}/{}", words[1]), words[1]);
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                [.., "target_groups", MGMT_FILE] => match verb {
                    "add" if words.len() == 2 => {
                        let tg_dir = format!("{parent}/{}", words[1]);
                        self.insert_dir(tg_dir.clone());
                        self.insert_file(format!("{tg_dir}/{MGMT_FILE}"), "");
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                // Target membership inside one ALUA target group.
                [.., "target_groups", _, MGMT_FILE] => match verb {
                    "add" if words.len() == 2 => {
                        self.insert_dir(format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    "del" if words.len() == 2 => {
                        self.remove_tree(&format!("{parent}/{}", words[1]));
                        self.set_result("0");
                    }
                    _ => self.set_result("-22"),
                },
                _ => self.set_result("-22"),
            }
        }
    }

    impl ControlFs for MockScst {
        fn read(&self, path: &Path) -> io::Result<String> {
            let key = path.to_string_lossy().to_string();
            match self.inner.nodes.borrow().get(&key) {
                Some(Node::File(content)) => Ok(content.clone()),
                Some(_) => Err(io::Error::new(io::ErrorKind::Other, "not a file")),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
            }
        }

        fn write(&self, path: &Path, data: &str) -> io::Result<()> {
            let key = path.to_string_lossy().to_string();
            if self
                .inner
                .fail_on
                .borrow()
                .iter()
                .any(|fragment| key.contains(fragment.as_str()))
            {
                return Err(io::Error::new(io::ErrorKind::Other, "injected failure"));
            }
            let value = data.trim_end().to_string();
            let parent = key.rsplit_once('/').map(|(dir, _)| dir.to_string());
            let parent_is_dir = parent
                .as_deref()
                .map(|dir| matches!(self.inner.nodes.borrow().get(dir), Some(Node::Dir)))
                .unwrap_or(false);
            if !parent_is_dir {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such file"));
            }
            self.inner.journal.borrow_mut().push((key.clone(), value.clone()));
            if key.ends_with(&format!("/{MGMT_FILE}")) {
                self.apply_mgmt(&key, &value);
            } else if value.is_empty() {
                self.inner.nodes.borrow_mut().insert(key, Node::File(String::new()));
            } else {
                self.inner
                    .nodes
                    .borrow_mut()
                    .insert(key, Node::File(format!("{value}\n{KEY_MARKER}")));
            }
            Ok(())
        }

        fn list(&self, path: &Path) -> Vec<String> {
            self.children(&path.to_string_lossy())
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner
                .nodes
                .borrow()
                .contains_key(&path.to_string_lossy().to_string())
        }

        fn is_dir(&self, path: &Path) -> bool {
            matches!(
                self.inner.nodes.borrow().get(&path.to_string_lossy().to_string()),
                Some(Node::Dir)
            )
        }

        fn link_name(&self, path: &Path) -> Option<String> {
            match self.inner.nodes.borrow().get(&path.to_string_lossy().to_string()) {
                Some(Node::Link(target)) => Some(target.clone()),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_marker_stripped_once() {
        let mock = mock::MockScst::new();
        mock.set_file("setup_id", "0x42\n[key]\n");
        let sysfs = mock.sysfs();
        let path = sysfs.root().join("setup_id");
        assert_eq!(sysfs.read_attribute(&path).unwrap(), "0x42");
        assert_eq!(sysfs.read_keyed_attribute(&path).unwrap(), "0x42");

        // A second marker is literal text after the first is removed.
        mock.set_file("setup_id", "0x42 [key]\n[key]\n");
        assert_eq!(sysfs.read_attribute(&path).unwrap(), "0x42 [key]");
    }

    #[test]
    fn test_default_attribute_is_not_keyed() {
        let mock = mock::MockScst::new();
        mock.set_file("threads", "4\n");
        let sysfs = mock.sysfs();
        let path = sysfs.root().join("threads");
        assert_eq!(sysfs.read_attribute(&path).unwrap(), "4");
        assert_eq!(sysfs.read_keyed_attribute(&path), None);
    }

    #[test]
    fn test_verify_surfaces_subsystem_result() {
        let mock = mock::MockScst::new();
        let sysfs = mock.sysfs();
        let mgmt = sysfs.luns_mgmt("copy_manager", "copy_manager_tgt");
        let err = sysfs
            .submit_management(&mgmt, "del 7", true)
            .unwrap_err();
        assert!(err.to_string().contains("subsystem reported"));
    }

    #[test]
    fn test_mgmt_add_device_materializes_tree() {
        let mock = mock::MockScst::new();
        let sysfs = mock.sysfs();
        sysfs
            .submit_management(
                &sysfs.handler_mgmt("vdisk_fileio"),
                "add_device d1 filename=/v/d1.img;blocksize=512",
                true,
            )
            .unwrap();
        assert!(mock.has_node("handlers/vdisk_fileio/d1"));
        let filename = sysfs
            .read_attribute(&sysfs.device_dir("vdisk_fileio", "d1").join("filename"))
            .unwrap();
        assert_eq!(filename, "/v/d1.img");
        // Device creation auto-populates the copy-manager target.
        assert!(mock.has_node("targets/copy_manager/copy_manager_tgt/luns/0/device"));
    }

    #[test]
    fn test_disk_fs_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("enabled");
        std::fs::write(&path, "0\n").unwrap();

        let sysfs = ScstSysfs::new(tmp.path(), Duration::from_secs(1));
        sysfs.write_attribute(&path, "1", false).unwrap();
        assert_eq!(sysfs.read_attribute(&path).unwrap(), "1");

        // Writes never create attributes.
        let missing = tmp.path().join("absent");
        let err = sysfs.write_attribute(&missing, "1", false).unwrap_err();
        assert!(err.to_string().contains("no such attribute"));
    }
}
