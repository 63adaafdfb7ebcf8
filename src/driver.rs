mod report;

use crate::cli::CONFIGURATION;
use crate::hwmon::{VcoreSensor, SYS_HWMON_PATH};
use crate::sweep;
use crate::topology::Topology;
use crate::tsc::{self, BusyLoop};
use crate::worker::{HardwareProbe, MeasurementPlan, WorkerPool};
use anyhow::{bail, Result};
use log::{info, trace};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const SETTLE_MS: u64 = 10; // let freshly spawned workers park before the first Start

/// The whole run: check the sensor, calibrate, discover cores, spawn one
/// worker per core, sweep, tear down.
pub struct Driver {
    plan: MeasurementPlan,
    calibration_window: Duration,
    sensor_driver: String,
    sensor_index: usize,
    max_cores: Option<usize>,
    csv_path: Option<PathBuf>,
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver {
    pub fn new() -> Self {
        let busy = Duration::from_millis(CONFIGURATION.busy_ms);
        Self {
            plan: MeasurementPlan {
                warmup: busy,
                iterations: CONFIGURATION.iterations,
                busy,
                tween: Duration::from_micros(CONFIGURATION.tween_us),
            },
            calibration_window: Duration::from_millis(CONFIGURATION.calibration_ms),
            sensor_driver: CONFIGURATION.sensor_driver.clone(),
            sensor_index: CONFIGURATION.sensor_index,
            max_cores: CONFIGURATION.max_cores,
            csv_path: CONFIGURATION.csv.as_ref().map(PathBuf::from),
        }
    }

    pub fn run(&self) -> Result<()> {
        if self.plan.iterations == 0 || self.plan.busy.is_zero() {
            bail!("Iterations and busy time must both be non-zero");
        }

        // Fatal preconditions come before any worker exists.
        let sensor = VcoreSensor::locate(
            Path::new(SYS_HWMON_PATH),
            &self.sensor_driver,
            self.sensor_index,
        )?;
        let mut topology = Topology::discover()?;
        if let Some(max_cores) = self.max_cores {
            topology.limit_cores(max_cores);
        }

        println!("*** Estimating base frequency...");
        let counter = tsc::default_counter();
        let frequency = tsc::calibrate(counter.as_ref(), self.calibration_window);
        println!("*** TSC Frequency: {frequency}");

        println!(
            "*** {} cores ({} CPUs) detected.",
            topology.cores().len(),
            topology.cpus().len()
        );

        let busy = BusyLoop::new(counter, frequency);
        let mut pool = WorkerPool::spawn(&topology, &busy, self.plan, move |cpu| {
            HardwareProbe::open(cpu, &sensor)
        })?;
        thread::sleep(Duration::from_millis(SETTLE_MS));

        let rows = sweep::run(pool.workers_mut(), |row| {
            println!("{row}");
            if let Err(e) = io::stdout().flush() {
                trace!("stdout flush failed: {e}");
            }
        })?;

        pool.shutdown();

        if let Some(path) = &self.csv_path {
            report::log_results(path, frequency, &rows)?;
            info!("Results appended to {}", path.display());
        }
        Ok(())
    }
}
