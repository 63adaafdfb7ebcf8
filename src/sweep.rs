use crate::topology::CoreId;
use crate::worker::{CoreWorker, SampleResult, SignalError};
use log::{debug, info};
use std::fmt::{self, Display, Formatter};

/// One concurrency level: the first `active.len()` cores loaded together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepRow {
    /// Cores started for this level, in start order.
    pub active: Vec<CoreId>,
    /// The core added at this level.
    pub tested: CoreId,
    pub tested_result: SampleResult,
    /// Core 0, loaded at every level.
    pub reference_result: SampleResult,
    /// Every active core's result, parallel to `active`.
    pub results: Vec<SampleResult>,
}

impl SweepRow {
    #[must_use]
    pub fn level(&self) -> usize {
        self.active.len()
    }
}

pub(crate) fn fmt_reading(value: Option<u64>) -> String {
    value.map_or_else(|| String::from("n/a"), |v| v.to_string())
}

impl Display for SweepRow {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let cores: Vec<String> = self.active.iter().map(ToString::to_string).collect();
        write!(
            f,
            "*** Core {} :: Freq = {}-{} MHz  VCore = {} mV",
            cores.join("+"),
            fmt_reading(self.tested_result.max_frequency_mhz),
            fmt_reading(self.reference_result.max_frequency_mhz),
            fmt_reading(self.tested_result.avg_voltage_mv),
        )
    }
}

/// For L = 1..=N, start the L lowest cores together, collect every result,
/// and report core L-1 against core 0. `on_row` sees each row as it
/// completes.
///
/// Blocks without limit on a worker that never reports.
pub fn run<F>(workers: &mut [CoreWorker], mut on_row: F) -> Result<Vec<SweepRow>, SignalError>
where
    F: FnMut(&SweepRow),
{
    let mut rows = Vec::with_capacity(workers.len());

    for level in 1..=workers.len() {
        let active = &mut workers[..level];
        let cores: Vec<CoreId> = active.iter().map(CoreWorker::core).collect();
        debug!("Sweep level {level}: starting {cores:?}");

        for worker in active.iter_mut() {
            worker.start()?;
        }

        let mut results = Vec::with_capacity(level);
        for worker in active.iter_mut() {
            results.push(worker.await_result()?);
        }

        let row = SweepRow {
            tested: cores[level - 1],
            tested_result: results[level - 1],
            reference_result: results[0],
            active: cores,
            results,
        };
        on_row(&row);
        rows.push(row);
    }

    info!("Sweep complete: {} levels", rows.len());
    Ok(rows)
}
