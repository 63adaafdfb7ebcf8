pub mod cli;
pub mod driver;
pub mod hwmon;
pub mod msr;
pub mod sweep;
pub mod topology;
pub mod tsc;
pub mod worker;

use log::warn;
use sysconf::raw::{sysconf, SysconfVariable};

/// Number of logical processors configured on this machine, online or not.
#[must_use]
pub fn core_count() -> usize {
    match sysconf(SysconfVariable::ScNprocessorsConf) {
        Ok(n) if n > 0 => n as usize,
        _ => {
            warn!("sysconf(_SC_NPROCESSORS_CONF) failed, scanning the full cpu set");
            libc::CPU_SETSIZE as usize
        }
    }
}
