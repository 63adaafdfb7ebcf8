use anyhow::{anyhow, Result};
use glob::glob;
use log::{debug, error, trace};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

// One sub-directory per sensor chip: hwmon0, hwmon1, ... Each holds a `name`
// file with the driver name plus one file per attribute (in0_input, in0_label,
// temp1_input, ...).
pub const SYS_HWMON_PATH: &str = "/sys/class/hwmon/";

/// A sensor chip found while enumerating the hwmon tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwmonDeviceInfo {
    /// Directory name, e.g. `hwmon2`.
    pub name: String,
    /// Contents of the chip's `name` attribute, e.g. `k10temp`.
    pub driver: String,
    pub path: PathBuf,
}

/// List every chip under `root`, ordered by hwmon index.
///
/// A chip whose `name` attribute cannot be read is listed with an empty driver.
pub fn device_list(root: &Path) -> Vec<HwmonDeviceInfo> {
    let pattern = root.join("*");
    let pattern = pattern.to_string_lossy();
    let mut devices = Vec::new();

    let paths = match glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            error!("Bad hwmon glob {pattern}: {e}");
            return devices;
        }
    };

    for path in paths {
        match path {
            Ok(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let driver = read_line(&path.join("name")).unwrap_or_default();
                devices.push(HwmonDeviceInfo { name, driver, path });
            }
            Err(e) => error!("Failed to load hwmon path: {e}"),
        }
    }
    devices.sort_by(|a, b| {
        trailing_number(&a.name)
            .cmp(&trailing_number(&b.name))
            .then_with(|| a.name.cmp(&b.name))
    });
    trace!("hwmon devices: {devices:#?}");

    devices
}

/// Open the `index`th chip (counting from 0) whose driver is `driver`.
#[must_use]
pub fn open_device(devices: &[HwmonDeviceInfo], driver: &str, index: usize) -> Option<Hwmon> {
    devices
        .iter()
        .filter(|d| d.driver == driver && d.path.is_dir())
        .nth(index)
        .map(|d| Hwmon {
            path: d.path.clone(),
        })
}

/// Handle on one sensor chip's attribute directory.
#[derive(Debug)]
pub struct Hwmon {
    path: PathBuf,
}

impl Hwmon {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Numeric attribute, `None` when missing or unparsable.
    #[must_use]
    pub fn read(&self, prop: &str) -> Option<i64> {
        let text = self.read_str(prop)?;
        match text.parse() {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("{}/{prop}: {text:?} is not a number: {e}", self.path.display());
                None
            }
        }
    }

    /// Text attribute with surrounding whitespace removed.
    #[must_use]
    pub fn read_str(&self, prop: &str) -> Option<String> {
        read_line(&self.path.join(prop))
    }

    pub fn write(&self, prop: &str, value: i64) -> io::Result<()> {
        self.write_str(prop, &value.to_string())
    }

    pub fn write_str(&self, prop: &str, value: &str) -> io::Result<()> {
        fs::write(self.path.join(prop), value)
    }

    /// Find the voltage input whose `inN_label` reads `label`, returning the
    /// matching `inN_input` attribute name. Channels are searched in order.
    #[must_use]
    pub fn find_voltage_input(&self, label: &str) -> Option<String> {
        let pattern = self.path.join("in*_label");
        let mut channels: Vec<u32> = glob(&pattern.to_string_lossy())
            .ok()?
            .filter_map(Result::ok)
            .filter_map(|p| {
                let file = p.file_name()?.to_str()?;
                file.strip_prefix("in")?.strip_suffix("_label")?.parse().ok()
            })
            .collect();
        channels.sort_unstable();

        channels
            .into_iter()
            .find(|n| self.read_str(&format!("in{n}_label")).as_deref() == Some(label))
            .map(|n| format!("in{n}_input"))
    }
}

/// Where each worker reads Vcore from: the chip selection plus the attribute
/// resolved at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcoreSensor {
    pub root: PathBuf,
    pub driver: String,
    pub index: usize,
    pub attribute: String,
}

impl VcoreSensor {
    pub const LABEL: &'static str = "Vcore";

    /// Resolve the chip and its Vcore input. Either missing is fatal for a run.
    pub fn locate(root: &Path, driver: &str, index: usize) -> Result<Self> {
        let devices = device_list(root);
        let chip = open_device(&devices, driver, index)
            .ok_or_else(|| anyhow!("{driver} unavailable"))?;
        let attribute = chip.find_voltage_input(Self::LABEL).ok_or_else(|| {
            anyhow!("VCore unavailable. ({driver} kernel module required)")
        })?;
        debug!("Vcore is {}/{attribute}", chip.path().display());

        Ok(Self {
            root: root.to_path_buf(),
            driver: driver.to_owned(),
            index,
            attribute,
        })
    }

    /// Open a private handle on the chip for one worker.
    #[must_use]
    pub fn open(&self) -> Option<Hwmon> {
        open_device(&device_list(&self.root), &self.driver, self.index)
    }
}

fn read_line(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(text) => Some(text.trim().to_owned()),
        Err(e) => {
            trace!("read({}) failed: {e}", path.display());
            None
        }
    }
}

fn trailing_number(name: &str) -> Option<u64> {
    let digits = name.trim_start_matches(|c: char| !c.is_ascii_digit());
    digits.parse().ok()
}
