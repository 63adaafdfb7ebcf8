use anyhow::{bail, Context, Result};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::mem;
use std::path::Path;

pub const SYS_CPU_PATH: &str = "/sys/devices/system/cpu";

/// Physical core identity. Core ids repeat across packages, so the package
/// is part of the key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoreId {
    pub package: u32,
    pub core: u32,
}

impl Display for CoreId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.package == 0 {
            write!(f, "{}", self.core)
        } else {
            write!(f, "{}.{}", self.package, self.core)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalProcessor {
    pub cpu_id: usize,
    pub core: CoreId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalCore {
    pub id: CoreId,
    /// The logical cpu this core's worker is pinned to.
    pub cpu_id: usize,
    /// Every allowed logical cpu on this core, ascending.
    pub siblings: Vec<usize>,
}

/// Logical cpus grouped by physical core. Built once at startup.
#[derive(Debug, Clone)]
pub struct Topology {
    cpus: Vec<LogicalProcessor>,
    cores: Vec<PhysicalCore>,
}

impl Topology {
    /// Discover the cpus this process may run on from the live sysfs tree.
    pub fn discover() -> Result<Self> {
        let cpus = allowed_cpus()?;
        Self::from_sysfs(Path::new(SYS_CPU_PATH), &cpus)
    }

    /// Build the registry from `<root>/cpuN/topology/*` for each listed cpu.
    /// The lowest numbered cpu of each core becomes its representative.
    pub fn from_sysfs(root: &Path, cpu_ids: &[usize]) -> Result<Self> {
        let mut cpu_ids = cpu_ids.to_vec();
        cpu_ids.sort_unstable();
        cpu_ids.dedup();

        if cpu_ids.is_empty() {
            bail!("No logical CPUs available");
        }

        let mut cpus = Vec::with_capacity(cpu_ids.len());
        let mut siblings: BTreeMap<CoreId, Vec<usize>> = BTreeMap::new();

        for cpu_id in cpu_ids {
            let dir = root.join(format!("cpu{cpu_id}")).join("topology");
            let core = read_id(&dir.join("core_id"))
                .with_context(|| format!("Failed to read core id of CPU {cpu_id}"))?;
            let package = read_id(&dir.join("physical_package_id")).unwrap_or(0);
            let core = CoreId { package, core };

            debug!("CPU {cpu_id} is on core {core}");
            cpus.push(LogicalProcessor { cpu_id, core });
            siblings.entry(core).or_default().push(cpu_id);
        }

        let cores = siblings
            .into_iter()
            .map(|(id, siblings)| PhysicalCore {
                id,
                cpu_id: siblings[0],
                siblings,
            })
            .collect();

        Ok(Self { cpus, cores })
    }

    /// Physical cores in ascending (package, core id) order.
    #[must_use]
    pub fn cores(&self) -> &[PhysicalCore] {
        &self.cores
    }

    #[must_use]
    pub fn cpus(&self) -> &[LogicalProcessor] {
        &self.cpus
    }

    #[must_use]
    pub fn cpu(&self, cpu_id: usize) -> Option<&LogicalProcessor> {
        self.cpus.iter().find(|c| c.cpu_id == cpu_id)
    }

    #[must_use]
    pub fn representative(&self, core: &PhysicalCore) -> Option<&LogicalProcessor> {
        self.cpu(core.cpu_id)
    }

    /// Keep only the first `max_cores` cores and the cpus belonging to them.
    pub fn limit_cores(&mut self, max_cores: usize) {
        if max_cores < self.cores.len() {
            info!("Limiting sweep to {max_cores} of {} cores", self.cores.len());
            self.cores.truncate(max_cores);
            let kept: Vec<CoreId> = self.cores.iter().map(|c| c.id).collect();
            self.cpus.retain(|cpu| kept.contains(&cpu.core));
        }
    }
}

fn read_id(path: &Path) -> Result<u32> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    text.trim()
        .parse()
        .with_context(|| format!("Bad id {:?} in {}", text.trim(), path.display()))
}

/// Logical cpus in this process's affinity mask.
pub fn allowed_cpus() -> Result<Vec<usize>> {
    // SAFETY: cpu_set_t is plain data; all-zero is the empty set
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    // SAFETY: `set` is a valid cpu_set_t of the size passed
    let rc = unsafe { libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        return Err(io::Error::last_os_error()).context("sched_getaffinity failed");
    }

    let limit = crate::core_count().min(libc::CPU_SETSIZE as usize);
    let mut cpus = Vec::new();
    for cpu in 0..limit {
        // SAFETY: cpu < CPU_SETSIZE
        if unsafe { libc::CPU_ISSET(cpu, &set) } {
            cpus.push(cpu);
        } else {
            info!("Skipping CPU {cpu}");
        }
    }
    Ok(cpus)
}

/// Restrict the calling thread to a single logical cpu.
pub fn pin_current_thread(cpu: usize) -> io::Result<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("CPU {cpu} outside the affinity mask range"),
        ));
    }
    // SAFETY: cpu_set_t is plain data; all-zero is the empty set
    let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
    // SAFETY: bounds checked above; pid 0 is the calling thread
    let rc = unsafe {
        libc::CPU_SET(cpu, &mut set);
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The cpu the calling thread is running on right now.
#[must_use]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: no preconditions
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_cpu(root: &Path, cpu: usize, core: &str, package: Option<&str>) {
        let dir = root.join(format!("cpu{cpu}/topology"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("core_id"), format!("{core}\n")).unwrap();
        if let Some(package) = package {
            fs::write(dir.join("physical_package_id"), format!("{package}\n")).unwrap();
        }
    }

    #[test]
    fn test_smt_pairs_group_into_cores() {
        let dir = TempDir::new().unwrap();
        for (cpu, core) in ["0", "0", "1", "1"].into_iter().enumerate() {
            fake_cpu(dir.path(), cpu, core, None);
        }

        let topology = Topology::from_sysfs(dir.path(), &[0, 1, 2, 3]).unwrap();
        assert_eq!(topology.cpus().len(), 4);
        assert_eq!(topology.cores().len(), 2);

        let core0 = &topology.cores()[0];
        assert_eq!(core0.id, CoreId { package: 0, core: 0 });
        assert_eq!(core0.cpu_id, 0);
        assert_eq!(core0.siblings, [0, 1]);

        let core1 = &topology.cores()[1];
        assert_eq!(core1.cpu_id, 2);
        assert_eq!(topology.representative(core1).unwrap().core.core, 1);
    }

    #[test]
    fn test_interleaved_siblings() {
        // Linux usually numbers SMT siblings N apart.
        let dir = TempDir::new().unwrap();
        for (cpu, core) in ["0", "1", "2", "0", "1", "2"].into_iter().enumerate() {
            fake_cpu(dir.path(), cpu, core, None);
        }

        let topology = Topology::from_sysfs(dir.path(), &[5, 4, 3, 2, 1, 0]).unwrap();
        let reps: Vec<usize> = topology.cores().iter().map(|c| c.cpu_id).collect();
        assert_eq!(reps, [0, 1, 2]);
        assert_eq!(topology.cores()[2].siblings, [2, 5]);
    }

    #[test]
    fn test_only_allowed_cpus_are_used() {
        let dir = TempDir::new().unwrap();
        for (cpu, core) in ["0", "0", "1", "1"].into_iter().enumerate() {
            fake_cpu(dir.path(), cpu, core, None);
        }

        let topology = Topology::from_sysfs(dir.path(), &[1, 3]).unwrap();
        let reps: Vec<usize> = topology.cores().iter().map(|c| c.cpu_id).collect();
        assert_eq!(reps, [1, 3]);
    }

    #[test]
    fn test_packages_keep_equal_core_ids_apart() {
        let dir = TempDir::new().unwrap();
        fake_cpu(dir.path(), 0, "0", Some("0"));
        fake_cpu(dir.path(), 1, "0", Some("1"));

        let topology = Topology::from_sysfs(dir.path(), &[0, 1]).unwrap();
        assert_eq!(topology.cores().len(), 2);
        assert_eq!(topology.cores()[1].id.to_string(), "1.0");
    }

    #[test]
    fn test_missing_core_id_is_fatal() {
        let dir = TempDir::new().unwrap();
        fake_cpu(dir.path(), 0, "0", None);
        assert!(Topology::from_sysfs(dir.path(), &[0, 1]).is_err());
    }

    #[test]
    fn test_bad_core_id_is_fatal() {
        let dir = TempDir::new().unwrap();
        fake_cpu(dir.path(), 0, "zero", None);
        let err = Topology::from_sysfs(dir.path(), &[0]).unwrap_err();
        assert!(format!("{err:#}").contains("core id of CPU 0"));
    }

    #[test]
    fn test_no_cpus_is_fatal() {
        let dir = TempDir::new().unwrap();
        assert!(Topology::from_sysfs(dir.path(), &[]).is_err());
    }

    #[test]
    fn test_limit_cores() {
        let dir = TempDir::new().unwrap();
        for cpu in 0..4 {
            fake_cpu(dir.path(), cpu, &cpu.to_string(), None);
        }
        let mut topology = Topology::from_sysfs(dir.path(), &[0, 1, 2, 3]).unwrap();
        topology.limit_cores(8);
        assert_eq!(topology.cores().len(), 4);
        topology.limit_cores(2);
        assert_eq!(topology.cores().len(), 2);
        assert_eq!(topology.cpus().len(), 2);
    }

    #[test]
    fn test_limit_cores_keeps_smt_siblings() {
        let dir = TempDir::new().unwrap();
        for (cpu, core) in ["0", "1", "2", "0", "1", "2"].into_iter().enumerate() {
            fake_cpu(dir.path(), cpu, core, None);
        }
        let mut topology = Topology::from_sysfs(dir.path(), &[0, 1, 2, 3, 4, 5]).unwrap();
        topology.limit_cores(2);
        let cpus: Vec<usize> = topology.cpus().iter().map(|c| c.cpu_id).collect();
        assert_eq!(cpus, [0, 1, 3, 4]);
        assert!(topology.cpu(2).is_none());
    }

    #[test]
    fn test_allowed_cpus_include_current() {
        let cpus = allowed_cpus().unwrap();
        assert!(!cpus.is_empty());
        if let Some(cpu) = current_cpu() {
            assert!(cpus.contains(&cpu));
        }
    }
}
