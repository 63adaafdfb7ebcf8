use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Incremented at base-clock rate while the cpu is busy.
pub const MSR_MPERF: u64 = 0xE7;

/// Incremented at actual clock rate while the cpu is busy.
pub const MSR_APERF: u64 = 0xE8;

/// AMD P-state definition registers, one per P-state.
#[must_use]
pub const fn msr_pstatedef(n: u64) -> u64 {
    0xC001_0064 + n
}

#[must_use]
pub fn msr_path(cpu: usize) -> PathBuf {
    PathBuf::from(format!("/dev/cpu/{cpu}/msr"))
}

/// Register-access handle for one logical cpu.
///
/// The device is closed when the handle is dropped. A handle whose device
/// could not be opened stays usable: every read yields `None`.
#[derive(Debug)]
pub struct Msr {
    cpu: usize,
    file: Option<File>,
}

impl Msr {
    pub fn open(cpu: usize) -> Self {
        Self::open_path(cpu, msr_path(cpu))
    }

    pub fn open_path<P: AsRef<Path>>(cpu: usize, path: P) -> Self {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| File::open(path));

        let file = match file {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("open({}) failed: {e}", path.display());
                None
            }
        };
        Self { cpu, file }
    }

    #[must_use]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Positioned 8-byte read of register `reg`.
    #[must_use]
    pub fn read(&self, reg: u64) -> Option<u64> {
        let file = self.file.as_ref()?;
        let mut buf = [0u8; 8];
        match file.read_exact_at(&mut buf, reg) {
            Ok(()) => Some(u64::from_le_bytes(buf)),
            Err(e) => {
                debug!("cpu {}: rdmsr {reg:#010x} failed: {e}", self.cpu);
                None
            }
        }
    }

    /// Positioned 8-byte write of register `reg`.
    pub fn write(&self, reg: u64, value: u64) -> io::Result<()> {
        let file = self.file.as_ref().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("msr device for cpu {} is not open", self.cpu),
            )
        })?;
        file.write_all_at(&value.to_le_bytes(), reg)
    }
}
