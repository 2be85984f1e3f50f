//! sysfs device records and mount lookup (Linux)
//!
//! USB devices live at `/sys/devices/.../usbN/<port>` with their descriptor
//! strings exposed as attribute files. Storage devices grow a
//! `.../block/<disk>/<partition>` subtree below their SCSI host once the
//! kernel has bound them, and the mount table maps the `/dev` node of that
//! block device to a directory.

use crate::mount::MountLookup;
use common::Result;
use model::UsbDevice;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Deepest level below a USB device searched for block devices
const BLOCK_SEARCH_DEPTH: usize = 8;

/// View of a sysfs tree
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Default for Sysfs {
    fn default() -> Self {
        Self::new("/sys")
    }
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute sysfs path of a kernel devpath (`/devices/...`)
    pub fn syspath(&self, devpath: &str) -> PathBuf {
        self.root.join(devpath.trim_start_matches('/'))
    }

    /// Build a device record for a kernel device
    ///
    /// Identifiers and strings come from the owning USB device's attribute
    /// files when they are still readable; `product_hint` (the uevent
    /// `PRODUCT=vid/pid/rev` value) fills in ids otherwise, which is the
    /// normal case on removal.
    pub fn device_record(
        &self,
        devpath: &str,
        devname: &str,
        product_hint: Option<&str>,
    ) -> UsbDevice {
        let usb_devpath = usb_device_devpath(devpath).unwrap_or(devpath);
        let dir = self.syspath(usb_devpath);

        let manufacturer = read_attr(&dir, "manufacturer");
        let product = read_attr(&dir, "product");
        let mut device = UsbDevice {
            device_name: device_node(devname),
            system_path: self.syspath(devpath).to_string_lossy().into_owned(),
            product: product.clone(),
            product_description: product,
            product_id: read_attr(&dir, "idProduct"),
            serial_number: read_attr(&dir, "serial"),
            vendor: manufacturer.clone(),
            vendor_description: manufacturer,
            vendor_id: read_attr(&dir, "idVendor"),
            ..Default::default()
        };

        if let Some((vendor_id, product_id)) = product_hint.and_then(parse_product_hint) {
            if device.vendor_id.is_empty() {
                device.vendor_id = vendor_id;
            }
            if device.product_id.is_empty() {
                device.product_id = product_id;
            }
        }

        device
    }

    /// Every present USB device (and USB serial console, if requested)
    pub fn enumerate(&self, include_tty: bool) -> Vec<UsbDevice> {
        let mut devices = Vec::new();

        for entry in self.entries("bus/usb/devices") {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Interfaces (`1-2:1.0`) have no device node of their own.
            if name.contains(':') {
                continue;
            }
            if let Some(device) = self.present_record(&entry.path(), false) {
                devices.push(device);
            }
        }

        if include_tty {
            for entry in self.entries("class/tty") {
                if let Some(device) = self.present_record(&entry.path(), true) {
                    devices.push(device);
                }
            }
        }

        devices
    }

    fn entries(&self, relative: &str) -> Vec<fs::DirEntry> {
        let dir = self.root.join(relative);
        match fs::read_dir(&dir) {
            Ok(entries) => {
                let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
                entries.sort_by_key(|e| e.file_name());
                entries
            }
            Err(e) => {
                debug!("Cannot list {}: {}", dir.display(), e);
                Vec::new()
            }
        }
    }

    fn present_record(&self, link: &Path, require_usb_ancestor: bool) -> Option<UsbDevice> {
        let devpath = self.devpath_of(link)?;
        if require_usb_ancestor && usb_device_devpath(&devpath).is_none() {
            return None;
        }

        let devname = uevent_value(&self.syspath(&devpath), "DEVNAME")?;
        Some(self.device_record(&devpath, &devname, None))
    }

    /// Kernel devpath of a (possibly symlinked) sysfs entry
    fn devpath_of(&self, link: &Path) -> Option<String> {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        let target = link.canonicalize().ok()?;
        let relative = target.strip_prefix(&root).ok()?;
        Some(format!("/{}", relative.to_string_lossy()))
    }
}

/// Devpath of the USB device owning `devpath`, if any
///
/// The owner is the deepest port component (`1-2`, `1-2.4`) below a
/// `usbN` root hub. Root hubs themselves have no owner.
pub fn usb_device_devpath(devpath: &str) -> Option<&str> {
    let mut offset = 0;
    let mut below_root_hub = false;
    let mut end = None;

    for segment in devpath.split('/') {
        let segment_end = offset + segment.len();
        if is_root_hub(segment) {
            below_root_hub = true;
        } else if below_root_hub && is_port(segment) {
            end = Some(segment_end);
        }
        offset = segment_end + 1;
    }

    end.map(|end| &devpath[..end])
}

fn is_root_hub(segment: &str) -> bool {
    segment
        .strip_prefix("usb")
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn is_port(segment: &str) -> bool {
    let Some((bus, ports)) = segment.split_once('-') else {
        return false;
    };
    !bus.is_empty()
        && bus.chars().all(|c| c.is_ascii_digit())
        && !ports.is_empty()
        && ports.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn device_node(devname: &str) -> String {
    if devname.starts_with('/') {
        devname.to_string()
    } else {
        format!("/dev/{}", devname)
    }
}

/// `951/1625/100` gives (`0951`, `1625`)
fn parse_product_hint(hint: &str) -> Option<(String, String)> {
    let mut parts = hint.split('/');
    let vendor = u16::from_str_radix(parts.next()?, 16).ok()?;
    let product = u16::from_str_radix(parts.next()?, 16).ok()?;
    Some((format!("{:04x}", vendor), format!("{:04x}", product)))
}

fn read_attr(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name))
        .map(|value| value.trim().to_string())
        .unwrap_or_default()
}

fn uevent_value(dir: &Path, key: &str) -> Option<String> {
    let contents = fs::read_to_string(dir.join("uevent")).ok()?;
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

/// Block devices below a USB device: (partitions, whole disks)
fn block_devices(device_dir: &Path) -> (Vec<String>, Vec<String>) {
    let mut partitions = Vec::new();
    let mut disks = Vec::new();
    let mut pending = vec![(device_dir.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            // Symlinks point back up the tree (driver, subsystem, port).
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }

            let path = entry.path();
            if entry.file_name() == "block" {
                collect_block(&path, &mut partitions, &mut disks);
            } else if depth < BLOCK_SEARCH_DEPTH {
                pending.push((path, depth + 1));
            }
        }
    }

    partitions.sort();
    disks.sort();
    (partitions, disks)
}

fn collect_block(block_dir: &Path, partitions: &mut Vec<String>, disks: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(block_dir) else {
        return;
    };

    for disk in entries.filter_map(|e| e.ok()) {
        let disk_name = disk.file_name().to_string_lossy().into_owned();
        if let Ok(children) = fs::read_dir(disk.path()) {
            for child in children.filter_map(|e| e.ok()) {
                if child.path().join("partition").is_file() {
                    partitions.push(child.file_name().to_string_lossy().into_owned());
                }
            }
        }
        disks.push(disk_name);
    }
}

/// Decode the octal escapes the kernel uses in the mount table
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Mount directory of a `/dev` node according to a mount table
pub fn find_mount(table: &str, node: &str) -> Option<String> {
    table.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let source = unescape_mount_field(fields.next()?);
        let target = fields.next()?;
        (source == node).then(|| unescape_mount_field(target))
    })
}

/// Mount lookup walking sysfs and the mount table
pub struct SysfsMountLookup {
    mount_table: PathBuf,
}

impl Default for SysfsMountLookup {
    fn default() -> Self {
        Self::new("/proc/mounts")
    }
}

impl SysfsMountLookup {
    pub fn new(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }
}

impl MountLookup for SysfsMountLookup {
    fn has_storage(&self, device: &UsbDevice) -> bool {
        if device.system_path.is_empty() {
            return false;
        }
        let (partitions, disks) = block_devices(Path::new(&device.system_path));
        !partitions.is_empty() || !disks.is_empty()
    }

    fn mount_point(&self, device: &UsbDevice) -> Result<Option<String>> {
        if device.system_path.is_empty() {
            return Ok(None);
        }

        let (partitions, disks) = block_devices(Path::new(&device.system_path));
        if partitions.is_empty() && disks.is_empty() {
            return Ok(None);
        }

        let table = fs::read_to_string(&self.mount_table).map_err(|e| {
            debug!("Cannot read {}: {}", self.mount_table.display(), e);
            e
        })?;

        Ok(partitions.iter().chain(disks.iter()).find_map(|name| {
            let node = format!("/dev/{}", name);
            trace!("Looking up mount of {}", node);
            find_mount(&table, &node)
        }))
    }
}
