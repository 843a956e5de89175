//! Contains the logic for cloning one block device onto another.
//!
//! A clone job moves through these stages on a dedicated worker thread:
//! 1.  Initializing: the active disks are resolved afresh and the pair is
//!     checked by [`crate::gate::validate_paths`]. A rejected pair never reaches
//!     an external process.
//! 2.  Copying: a byte-for-byte copy with `dd`.
//! 3.  Verifying (optional): a byte compare with `cmp`.
//!
//! The caller observes the job through a [`JobHandle`] and stops it with a
//! [`CancelToken`]. Each orchestrator runs at most one job at a time.
use crate::active::resolve_active_disks;
use crate::error::{Error, Result};
use crate::exec::{
    CommandSpec, DEFAULT_POLL_INTERVAL, DEFAULT_TERMINATION_GRACE, Executor, OperationResult,
    Outcome,
};
use crate::gate;
use crate::probe::SystemProbe;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, info_span, warn};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

/// Use a 1 MiB block for copies.
pub const DEFAULT_BLOCK_SIZE: u64 = MIB;

/// Progress never reaches 100 before the external tool has actually finished.
const PROGRESS_CEILING: u8 = 90;
const COPY_PROGRESS_STEP: u8 = 1;
const VERIFY_PROGRESS_STEP: u8 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloneMethod {
    /// Bit-by-bit copy of the whole device.
    #[default]
    Full,
    /// Used-sectors-only copy. Currently performed as a full copy.
    Smart,
}

impl fmt::Display for CloneMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloneMethod::Full => f.write_str("full"),
            CloneMethod::Smart => f.write_str("smart"),
        }
    }
}

/// A shared flag the controlling thread sets to stop a running job.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A request to clone `source` onto `destination`.
#[derive(Clone, Debug)]
pub struct CloneJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub method: CloneMethod,
    pub verify: bool,
    cancel: CancelToken,
}

impl CloneJob {
    /// A full clone with verification.
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            method: CloneMethod::Full,
            verify: true,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_method(mut self, method: CloneMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Uses an existing token, e.g. one already wired to a Ctrl+C handler.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

/// Where a job is in its lifecycle. States only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum JobState {
    Idle = 0,
    Initializing = 1,
    Copying = 2,
    Verifying = 3,
    Completed = 4,
    Failed = 5,
    Cancelled = 6,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => JobState::Initializing,
            2 => JobState::Copying,
            3 => JobState::Verifying,
            4 => JobState::Completed,
            5 => JobState::Failed,
            6 => JobState::Cancelled,
            _ => JobState::Idle,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Initializing => "initializing",
            JobState::Copying => "copying",
            JobState::Verifying => "verifying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The verdict of the verification stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verification {
    /// Not requested, or the job ended before it could run.
    Skipped,
    Identical,
    /// The compare tool found differences. The job still completes, but the
    /// caller must surface this.
    Mismatch,
}

/// The terminal summary of a clone job.
#[derive(Debug)]
pub struct JobReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub method: CloneMethod,
    pub state: JobState,
    pub verification: Verification,
    /// Why the job failed, when it did.
    pub error: Option<Error>,
    pub copy: Option<OperationResult>,
    pub compare: Option<OperationResult>,
}

impl JobReport {
    fn new(source: &Path, destination: &Path, method: CloneMethod) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            method,
            state: JobState::Idle,
            verification: Verification::Skipped,
            error: None,
            copy: None,
            compare: None,
        }
    }

    pub fn is_mismatch(&self) -> bool {
        self.verification == Verification::Mismatch
    }
}

/// Tunables for clone jobs.
#[derive(Clone, Debug)]
pub struct CloneSettings {
    /// Bytes per `dd` block.
    pub block_size: u64,
    /// How often the running tool is polled for exit, progress and cancellation.
    pub poll_interval: Duration,
    /// How long a cancelled tool may take to exit before it is killed.
    pub termination_grace: Duration,
    pub copy_program: String,
    pub compare_program: String,
}

impl Default for CloneSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            termination_grace: DEFAULT_TERMINATION_GRACE,
            copy_program: "dd".to_string(),
            compare_program: "cmp".to_string(),
        }
    }
}

impl CloneSettings {
    /// `dd if=<source> of=<destination> bs=<block> conv=fdatasync status=progress`
    pub fn copy_command(&self, source: &Path, destination: &Path) -> CommandSpec {
        CommandSpec::new(&self.copy_program).args([
            format!("if={}", source.display()),
            format!("of={}", destination.display()),
            format!("bs={}", dd_block_size(self.block_size)),
            "conv=fdatasync".to_string(),
            "status=progress".to_string(),
        ])
    }

    /// `cmp <source> <destination>`
    pub fn compare_command(&self, source: &Path, destination: &Path) -> CommandSpec {
        CommandSpec::new(&self.compare_program)
            .arg(source.display().to_string())
            .arg(destination.display().to_string())
    }
}

/// Formats a byte count the way `dd` spells block sizes.
fn dd_block_size(bytes: u64) -> String {
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{}M", bytes / MIB)
    } else if bytes >= KIB && bytes % KIB == 0 {
        format!("{}K", bytes / KIB)
    } else {
        bytes.to_string()
    }
}

/// State and progress, written by the worker and read by everyone else.
#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    progress: AtomicU8,
}

impl Shared {
    fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: JobState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    fn set_progress(&self, percent: u8) {
        self.progress.store(percent.min(100), Ordering::SeqCst);
    }

    /// Raises progress by `step`, never past the ceiling.
    fn bump_progress(&self, step: u8) {
        let _ = self
            .progress
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p < PROGRESS_CEILING).then(|| p.saturating_add(step).min(PROGRESS_CEILING))
            });
    }
}

/// Frees the orchestrator's job slot when dropped, even if the worker panics.
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Observes and controls a running clone job.
pub struct JobHandle {
    shared: Arc<Shared>,
    cancel: CancelToken,
    source: PathBuf,
    destination: PathBuf,
    method: CloneMethod,
    worker: JoinHandle<JobReport>,
}

impl JobHandle {
    pub fn state(&self) -> JobState {
        self.shared.state()
    }

    /// Progress of the current stage, 0 to 100.
    pub fn progress(&self) -> u8 {
        self.shared.progress()
    }

    /// Requests cancellation. Honoured within one poll interval.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// True once the worker thread has returned.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Blocks until the job ends and returns its report.
    pub fn wait(self) -> JobReport {
        match self.worker.join() {
            Ok(report) => report,
            Err(_) => {
                error!(
                    source = %self.source.display(),
                    destination = %self.destination.display(),
                    "clone worker panicked"
                );
                self.shared.set_state(JobState::Failed);
                let mut report = JobReport::new(&self.source, &self.destination, self.method);
                report.state = JobState::Failed;
                report.error = Some(Error::WorkerPanicked);
                report
            }
        }
    }
}

/// Starts clone jobs, one at a time, after validating them against the
/// disks the running system depends on.
pub struct CloneOrchestrator<P> {
    probe: Arc<P>,
    settings: CloneSettings,
    busy: Arc<AtomicBool>,
}

impl<P> CloneOrchestrator<P>
where
    P: SystemProbe + 'static,
{
    pub fn new(probe: P, settings: CloneSettings) -> Self {
        Self::with_shared_probe(Arc::new(probe), settings)
    }

    pub fn with_shared_probe(probe: Arc<P>, settings: CloneSettings) -> Self {
        Self {
            probe,
            settings,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while a job started by this orchestrator has not finished.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Starts `job` on a worker thread.
    ///
    /// The safety checks run on the worker as the job's first stage; a
    /// rejected pair ends the job as [`JobState::Failed`] with the gate's
    /// error.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] if another job of this orchestrator is
    /// still running or the worker thread cannot be spawned.
    pub fn start(&self, job: CloneJob) -> Result<JobHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!(
                source = %job.source.display(),
                destination = %job.destination.display(),
                "refusing to start a second clone job"
            );
            return Err(Error::ResourceExhausted(
                "a clone job is already running".to_string(),
            ));
        }
        let slot = SlotGuard(Arc::clone(&self.busy));

        let shared = Arc::new(Shared::default());
        let handle_parts = (
            job.cancel.clone(),
            job.source.clone(),
            job.destination.clone(),
            job.method,
        );

        let worker = Worker {
            probe: Arc::clone(&self.probe),
            executor: Executor::new(self.settings.poll_interval, self.settings.termination_grace),
            settings: self.settings.clone(),
            shared: Arc::clone(&shared),
            job,
            slot,
        };

        let worker = thread::Builder::new()
            .name("clonr-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| Error::ResourceExhausted(format!("cannot spawn clone worker: {e}")))?;

        let (cancel, source, destination, method) = handle_parts;
        Ok(JobHandle {
            shared,
            cancel,
            source,
            destination,
            method,
            worker,
        })
    }
}

struct Worker<P> {
    probe: Arc<P>,
    executor: Executor,
    settings: CloneSettings,
    shared: Arc<Shared>,
    job: CloneJob,
    slot: SlotGuard,
}

impl<P: SystemProbe> Worker<P> {
    fn run(self) -> JobReport {
        let span = info_span!(
            "clone",
            source = %self.job.source.display(),
            destination = %self.job.destination.display(),
            method = %self.job.method,
        );
        let _enter = span.enter();

        let mut report = JobReport::new(&self.job.source, &self.job.destination, self.job.method);
        let state = match self.execute(&mut report) {
            Ok(state) => state,
            Err(err) => {
                error!(%err, "clone job failed");
                report.error = Some(err);
                JobState::Failed
            }
        };
        report.state = state;

        // Publish the terminal state before freeing the slot, so a new job
        // can never start while this one still looks unfinished.
        let Worker { shared, slot, .. } = self;
        shared.set_state(state);
        drop(slot);

        match (state, report.verification) {
            (JobState::Completed, Verification::Mismatch) => {
                warn!("clone completed but verification found differences")
            }
            (JobState::Completed, _) => info!("clone completed"),
            (JobState::Cancelled, _) => warn!("clone cancelled, destination is incomplete"),
            _ => {}
        }
        report
    }

    fn advance(&self, state: JobState) {
        debug_assert!(state > self.shared.state(), "job states only move forward");
        info!(%state, "clone job state");
        self.shared.set_state(state);
    }

    fn execute(&self, report: &mut JobReport) -> Result<JobState> {
        self.advance(JobState::Initializing);

        let active = resolve_active_disks(self.probe.as_ref())?;
        gate::validate_paths(&self.job.source, &self.job.destination, &active)?;

        if self.job.cancel.is_cancelled() {
            return Ok(JobState::Cancelled);
        }

        if self.job.method == CloneMethod::Smart {
            warn!("filesystem-aware copy is not available, performing a full byte-for-byte copy");
        }

        self.advance(JobState::Copying);
        let copy_cmd = self
            .settings
            .copy_command(&self.job.source, &self.job.destination);
        let copy = self.run_step(&copy_cmd, COPY_PROGRESS_STEP)?;
        let outcome = copy.outcome;
        let failure = copy.to_error(&copy_cmd.program);
        report.copy = Some(copy);
        match outcome {
            Outcome::Cancelled => return Ok(JobState::Cancelled),
            Outcome::Failed => return Err(failure),
            Outcome::Completed => self.shared.set_progress(100),
        }

        if !self.job.verify {
            return Ok(JobState::Completed);
        }
        if self.job.cancel.is_cancelled() {
            return Ok(JobState::Cancelled);
        }

        self.advance(JobState::Verifying);
        self.shared.set_progress(0);
        let compare_cmd = self
            .settings
            .compare_command(&self.job.source, &self.job.destination);
        let compare = self.run_step(&compare_cmd, VERIFY_PROGRESS_STEP)?;
        let outcome = compare.outcome;
        let exit_code = compare.exit_code;
        let failure = compare.to_error(&compare_cmd.program);
        report.compare = Some(compare);

        match (outcome, exit_code) {
            (Outcome::Cancelled, _) => Ok(JobState::Cancelled),
            (Outcome::Completed, _) => {
                report.verification = Verification::Identical;
                self.shared.set_progress(100);
                Ok(JobState::Completed)
            }
            (Outcome::Failed, Some(1)) => {
                report.verification = Verification::Mismatch;
                self.shared.set_progress(100);
                Ok(JobState::Completed)
            }
            (Outcome::Failed, _) => Err(failure),
        }
    }

    fn run_step(&self, spec: &CommandSpec, step: u8) -> Result<OperationResult> {
        let shared = &self.shared;
        let cancel = &self.job.cancel;
        self.executor
            .run(spec, || shared.bump_progress(step), || cancel.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::CannedProbe;

    #[test]
    fn copy_command_uses_block_size_and_sync() {
        let settings = CloneSettings::default();
        let spec = settings.copy_command(Path::new("/dev/sdb"), Path::new("/dev/sdc"));
        assert_eq!(
            spec.to_string(),
            "dd if=/dev/sdb of=/dev/sdc bs=1M conv=fdatasync status=progress"
        );
    }

    #[test]
    fn compare_command_lists_both_devices() {
        let settings = CloneSettings::default();
        let spec = settings.compare_command(Path::new("/dev/sdb"), Path::new("/dev/sdc"));
        assert_eq!(spec.to_string(), "cmp /dev/sdb /dev/sdc");
    }

    #[test]
    fn block_sizes_use_dd_suffixes() {
        assert_eq!(dd_block_size(MIB), "1M");
        assert_eq!(dd_block_size(4 * MIB), "4M");
        assert_eq!(dd_block_size(64 * KIB), "64K");
        assert_eq!(dd_block_size(512), "512");
        assert_eq!(dd_block_size(1536 * KIB), "1536K");
    }

    #[test]
    fn progress_is_capped_below_completion() {
        let shared = Shared::default();
        for _ in 0..200 {
            shared.bump_progress(VERIFY_PROGRESS_STEP);
        }
        assert_eq!(shared.progress(), PROGRESS_CEILING);

        shared.set_progress(100);
        shared.bump_progress(COPY_PROGRESS_STEP);
        assert_eq!(shared.progress(), 100);
    }

    #[test]
    fn job_states_round_trip_through_storage() {
        for state in [
            JobState::Idle,
            JobState::Initializing,
            JobState::Copying,
            JobState::Verifying,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::from_u8(state as u8), state);
        }
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Verifying.is_terminal());
    }

    #[test]
    fn slot_is_freed_only_after_the_terminal_state_is_published() {
        let busy = Arc::new(AtomicBool::new(true));
        let shared = Arc::new(Shared::default());
        let worker = Worker {
            // No mount table, so the job fails during initialization.
            probe: Arc::new(CannedProbe::new()),
            executor: Executor::default(),
            settings: CloneSettings::default(),
            shared: Arc::clone(&shared),
            job: CloneJob::new("/dev/sdb", "/dev/sdc"),
            slot: SlotGuard(Arc::clone(&busy)),
        };

        let observer = {
            let busy = Arc::clone(&busy);
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while busy.load(Ordering::SeqCst) {
                    std::hint::spin_loop();
                }
                shared.state()
            })
        };

        let report = thread::spawn(move || worker.run()).join().unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(observer.join().unwrap(), JobState::Failed);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let job = CloneJob::new("/dev/sdb", "/dev/sdc").with_cancel_token(token.clone());
        assert!(!job.cancel_token().is_cancelled());
        token.cancel();
        assert!(job.cancel_token().is_cancelled());
    }
}
