use crate::hwmon::{Hwmon, VcoreSensor};
use crate::msr::{Msr, MSR_APERF};
use crate::topology::{pin_current_thread, CoreId, Topology};
use crate::tsc::BusyLoop;
use anyhow::{Context, Result};
use log::{debug, error, info, trace, warn};
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const BUSY_ITERS: u32 = 10;
pub const BUSY_MS: u64 = 20;
pub const TWEEN_SLEEP_US: u64 = 0;

/// The fixed protocol a worker runs for each `Start`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MeasurementPlan {
    /// Unrecorded spin before the first iteration.
    pub warmup: Duration,
    pub iterations: u32,
    /// Spin per iteration. Also the divisor turning counter deltas into MHz.
    pub busy: Duration,
    /// Sleep before each iteration.
    pub tween: Duration,
}

impl Default for MeasurementPlan {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(BUSY_MS),
            iterations: BUSY_ITERS,
            busy: Duration::from_millis(BUSY_MS),
            tween: Duration::from_micros(TWEEN_SLEEP_US),
        }
    }
}

/// What a worker reports after one burst. `None` means no iteration produced
/// a usable reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SampleResult {
    pub max_frequency_mhz: Option<u64>,
    pub avg_voltage_mv: Option<u64>,
    /// Iterations whose counter delta was available.
    pub frequency_samples: u32,
    /// Iterations whose voltage was available.
    pub voltage_samples: u32,
}

/// Per-core hardware readings used inside a burst.
pub trait CoreProbe: Send {
    /// Actual-clock (APERF) counter.
    fn actual_cycles(&mut self) -> Option<u64>;
    /// Instantaneous core voltage.
    fn vcore_mv(&mut self) -> Option<u64>;
}

/// Reads APERF through the cpu's MSR device and Vcore through hwmon. Both
/// handles are private to one worker and closed when it exits.
#[derive(Debug)]
pub struct HardwareProbe {
    msr: Msr,
    chip: Option<Hwmon>,
    attribute: String,
}

impl HardwareProbe {
    pub fn open(cpu: usize, sensor: &VcoreSensor) -> Self {
        let chip = sensor.open();
        if chip.is_none() {
            warn!("CPU {cpu}: {} unavailable, Vcore will not be sampled", sensor.driver);
        }
        Self {
            msr: Msr::open(cpu),
            chip,
            attribute: sensor.attribute.clone(),
        }
    }
}

impl CoreProbe for HardwareProbe {
    fn actual_cycles(&mut self) -> Option<u64> {
        self.msr.read(MSR_APERF)
    }

    fn vcore_mv(&mut self) -> Option<u64> {
        let mv = self.chip.as_ref()?.read(&self.attribute)?;
        // A zero Vcore is a failed read, never a real sample.
        u64::try_from(mv).ok().filter(|&mv| mv > 0)
    }
}

/// Folds per-iteration readings into a `SampleResult`: peak counter delta,
/// mean voltage. Unavailable readings are left out of both.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    max_cycles: Option<u64>,
    frequency_samples: u32,
    voltage_sum: u64,
    voltage_samples: u32,
}

impl Accumulator {
    pub fn record(&mut self, cycles: Option<u64>, vcore_mv: Option<u64>) {
        if let Some(cycles) = cycles {
            self.max_cycles = Some(self.max_cycles.map_or(cycles, |max| max.max(cycles)));
            self.frequency_samples += 1;
        }
        if let Some(mv) = vcore_mv {
            self.voltage_sum += mv;
            self.voltage_samples += 1;
        }
    }

    /// `busy` is the spin duration each delta was taken over. Cycles per
    /// microsecond is MHz.
    #[must_use]
    pub fn finish(&self, busy: Duration) -> SampleResult {
        let busy_us = busy.as_micros().max(1);
        SampleResult {
            max_frequency_mhz: self
                .max_cycles
                .map(|cycles| (u128::from(cycles) / busy_us) as u64),
            avg_voltage_mv: (self.voltage_samples > 0)
                .then(|| self.voltage_sum / u64::from(self.voltage_samples)),
            frequency_samples: self.frequency_samples,
            voltage_samples: self.voltage_samples,
        }
    }
}

/// Run one burst: warm-up, then `plan.iterations` timed spins.
pub fn measure<P: CoreProbe + ?Sized>(
    probe: &mut P,
    busy: &BusyLoop,
    plan: &MeasurementPlan,
) -> SampleResult {
    busy.spin(plan.warmup);

    let mut acc = Accumulator::default();
    for i in 0..plan.iterations {
        if !plan.tween.is_zero() {
            thread::sleep(plan.tween);
        }

        let start = probe.actual_cycles();
        busy.spin(plan.busy);
        let end = probe.actual_cycles();
        let vcore = probe.vcore_mv();

        let cycles = match (start, end) {
            (Some(start), Some(end)) => Some(end.wrapping_sub(start)),
            _ => None,
        };
        trace!("iteration {i}: cycles {cycles:?}, vcore {vcore:?} mV");
        acc.record(cycles, vcore);
    }

    let result = acc.finish(plan.busy);
    if result.frequency_samples < plan.iterations || result.voltage_samples < plan.iterations {
        warn!(
            "Degraded burst: {}/{} frequency and {}/{} voltage samples",
            result.frequency_samples, plan.iterations, result.voltage_samples, plan.iterations
        );
    }
    result
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// `start` while a previous `Start` has not had its result consumed.
    Busy(CoreId),
    /// `await_result` with no `Start` outstanding.
    Idle(CoreId),
    /// The worker thread has exited.
    Disconnected(CoreId),
}

impl Display for SignalError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            SignalError::Busy(core) => write!(f, "core {core} already has a burst in flight"),
            SignalError::Idle(core) => write!(f, "core {core} has no burst in flight"),
            SignalError::Disconnected(core) => write!(f, "core {core} worker has exited"),
        }
    }
}

impl Error for SignalError {}

/// Shared shutdown flag. Workers observe it only while parked.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct ResultState {
    ready: Option<SampleResult>,
    exited: bool,
}

/// Command slot (controller to worker) and result slot (worker to
/// controller), each with its own lock and condition variable.
#[derive(Debug, Default)]
struct Channels {
    command: Mutex<Option<Command>>,
    command_ready: Condvar,
    result: Mutex<ResultState>,
    result_ready: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Channels {
    fn send(&self, command: Command) {
        *lock(&self.command) = Some(command);
        self.command_ready.notify_one();
    }

    /// Park until a command arrives. `None` once cancelled.
    fn receive(&self, cancel: &CancellationToken) -> Option<Command> {
        let mut pending = lock(&self.command);
        loop {
            // Cancel point. Never reached mid-burst.
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(command) = pending.take() {
                return Some(command);
            }
            pending = self
                .command_ready
                .wait(pending)
                .unwrap_or_else(PoisonError::into_inner);
            if pending.is_none() && !cancel.is_cancelled() {
                trace!("Spurious wake-up");
            }
        }
    }

    /// Taking the lock first orders this after any concurrent check of the
    /// cancellation flag in `receive`.
    fn wake(&self) {
        let _pending = lock(&self.command);
        self.command_ready.notify_all();
    }

    fn publish(&self, result: SampleResult) {
        lock(&self.result).ready = Some(result);
        self.result_ready.notify_all();
    }

    fn mark_exited(&self) {
        lock(&self.result).exited = true;
        self.result_ready.notify_all();
    }

    /// Block until a result is published, consuming it. `None` if the worker
    /// exited first.
    fn take_result(&self) -> Option<SampleResult> {
        let mut state = lock(&self.result);
        loop {
            if let Some(result) = state.ready.take() {
                return Some(result);
            }
            if state.exited {
                return None;
            }
            state = self
                .result_ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Flags the result channel when the worker thread ends, panics included.
struct ExitGuard(Arc<Channels>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.mark_exited();
    }
}

fn run_worker<P: CoreProbe>(
    core: CoreId,
    channels: &Channels,
    mut probe: P,
    busy: &BusyLoop,
    plan: &MeasurementPlan,
    cancel: &CancellationToken,
) {
    while let Some(command) = channels.receive(cancel) {
        match command {
            Command::Start => {
                debug!("Core {core}: burst start");
                let result = measure(&mut probe, busy, plan);
                debug!("Core {core}: {result:?}");
                channels.publish(result);
            }
        }
    }
    debug!("Core {core}: worker exiting");
}

/// Controller-side handle on one core's persistent worker thread.
#[derive(Debug)]
pub struct CoreWorker {
    core: CoreId,
    cpu_id: usize,
    channels: Arc<Channels>,
    thread: Option<JoinHandle<()>>,
    in_flight: bool,
}

impl CoreWorker {
    /// Start a worker pinned to `cpu_id`. `open_probe` runs on the worker
    /// thread so its handles belong to that thread alone.
    pub fn spawn<P, F>(
        core: CoreId,
        cpu_id: usize,
        open_probe: F,
        busy: BusyLoop,
        plan: MeasurementPlan,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        P: CoreProbe + 'static,
        F: FnOnce(usize) -> P + Send + 'static,
    {
        let channels = Arc::new(Channels::default());
        let worker_channels = Arc::clone(&channels);

        let thread = thread::Builder::new()
            .name(format!("core-{core}"))
            .spawn(move || {
                let _exit = ExitGuard(Arc::clone(&worker_channels));
                if let Err(e) = pin_current_thread(cpu_id) {
                    warn!("Core {core}: failed to pin to CPU {cpu_id}: {e}");
                }
                let probe = open_probe(cpu_id);
                run_worker(core, &worker_channels, probe, &busy, &plan, &cancel);
            })
            .with_context(|| format!("Failed to spawn worker for core {core}"))?;

        Ok(Self {
            core,
            cpu_id,
            channels,
            thread: Some(thread),
            in_flight: false,
        })
    }

    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    #[must_use]
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Issue `Start`. Only one burst may be outstanding per core.
    pub fn start(&mut self) -> Result<(), SignalError> {
        if self.in_flight {
            return Err(SignalError::Busy(self.core));
        }
        self.channels.send(Command::Start);
        self.in_flight = true;
        Ok(())
    }

    /// Block until the outstanding burst reports. There is no timeout.
    pub fn await_result(&mut self) -> Result<SampleResult, SignalError> {
        if !self.in_flight {
            return Err(SignalError::Idle(self.core));
        }
        let result = self.channels.take_result();
        self.in_flight = false;
        result.ok_or(SignalError::Disconnected(self.core))
    }

    fn wake(&self) {
        self.channels.wake();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Core {} worker panicked", self.core);
            }
        }
    }
}

/// One worker per physical core, in topology order.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<CoreWorker>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn spawn<P, F>(
        topology: &Topology,
        busy: &BusyLoop,
        plan: MeasurementPlan,
        open_probe: F,
    ) -> Result<Self>
    where
        P: CoreProbe + 'static,
        F: Fn(usize) -> P + Send + Sync + 'static,
    {
        let open_probe = Arc::new(open_probe);
        let cancel = CancellationToken::default();
        let mut pool = Self {
            workers: Vec::with_capacity(topology.cores().len()),
            cancel: cancel.clone(),
        };

        for core in topology.cores() {
            info!("Creating thread core {} CPU {}", core.id, core.cpu_id);
            let open_probe = Arc::clone(&open_probe);
            let worker = CoreWorker::spawn(
                core.id,
                core.cpu_id,
                move |cpu| open_probe(cpu),
                busy.clone(),
                plan,
                cancel.clone(),
            )?;
            pool.workers.push(worker);
        }

        Ok(pool)
    }

    #[must_use]
    pub fn workers(&self) -> &[CoreWorker] {
        &self.workers
    }

    pub fn workers_mut(&mut self) -> &mut [CoreWorker] {
        &mut self.workers
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Cancel and join every worker. A worker mid-burst finishes the burst
    /// first. Calling this again is a no-op.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.cancel.cancel();
        for worker in &self.workers {
            worker.wake();
        }
        for mut worker in self.workers.drain(..) {
            worker.join();
        }
        debug!("All workers joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
