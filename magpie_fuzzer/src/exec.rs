//! Target execution and sample delivery. The target is spawned per run
//! and writes the coverage it touched into a per-worker shared memory
//! region; delivery hands it the sample through a file or a second
//! shared memory region, whichever `@@` was rewritten to.

use anyhow::{bail, Context};
use magpie_core::coverage::Coverage;
use magpie_core::sample::Sample;
use magpie_core::MAX_SAMPLE_SIZE;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::ptr;
use std::time::{Duration, Instant};

/// Outcome of one target execution. Crashes and hangs are values, not
/// errors; they are counted and preserved, never raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    Ok,
    Crash,
    Hang,
    Other,
}

/// What the coordinator needs from an instrumentation backend.
pub trait Instrumentation {
    fn run(
        &mut self,
        argv: &[String],
        init_timeout: Duration,
        timeout: Duration,
    ) -> anyhow::Result<RunResult>;
    /// Like `run`, for reproducing a crash; coverage from these runs is
    /// thrown away by the caller.
    fn run_with_crash_analysis(
        &mut self,
        argv: &[String],
        init_timeout: Duration,
        timeout: Duration,
    ) -> anyhow::Result<RunResult>;
    /// Coverage collected by the last run, optionally clearing it.
    fn coverage(&mut self, clear: bool) -> Coverage;
    fn clear_coverage(&mut self);
    fn crash_name(&self) -> String;
    /// Stop reporting these offsets from future runs.
    fn ignore_coverage(&mut self, coverage: &Coverage);
    /// Reset the target to a known-good state.
    fn clean_target(&mut self);
}

pub trait SampleDelivery {
    fn deliver(&mut self, sample: &Sample) -> anyhow::Result<()>;
}

/// Env var pointing the target at its coverage channel.
pub const COVERAGE_SHM_ENV: &str = "MAGPIE_COVERAGE_SHM";
pub const COVERAGE_SHM_MAGIC: u32 = 0x4d41_4743;
pub const COVERAGE_SHM_SIZE: usize = 1 << 20;

/// Runs the target as a fresh subprocess each execution. A signal
/// death is a crash named after the signal; an expired timeout kills
/// the child and counts as a hang.
pub struct CommandInstrumentation {
    shm: Shmem,
    shm_id: String,
    ignored: Coverage,
    collected: Coverage,
    last_crash: Option<String>,
    has_run: bool,
}

impl CommandInstrumentation {
    pub fn new(worker_id: u64) -> anyhow::Result<Self> {
        let shm_id = format!("magpie_cov_{}_{}", std::process::id(), worker_id);
        let shm = create_shm(&shm_id, COVERAGE_SHM_SIZE)?;
        let mut this = Self {
            shm,
            shm_id,
            ignored: Coverage::new(),
            collected: Coverage::new(),
            last_crash: None,
            has_run: false,
        };
        this.reset_channel();
        Ok(this)
    }

    pub fn shm_id(&self) -> &str {
        &self.shm_id
    }

    fn reset_channel(&mut self) {
        unsafe { ptr::write_bytes(self.shm.as_ptr(), 0, 8) }
    }

    fn collect_channel(&mut self) {
        let parsed = {
            let bytes = unsafe { std::slice::from_raw_parts(self.shm.as_ptr(), self.shm.len()) };
            if bytes.len() < 4
                || u32::from_le_bytes(bytes[..4].try_into().unwrap()) != COVERAGE_SHM_MAGIC
            {
                Coverage::new()
            } else {
                match Coverage::read_from(&mut Cursor::new(&bytes[4..])) {
                    Ok(cov) => cov,
                    Err(e) => {
                        log::warn!("malformed coverage channel, dropping run coverage: {}", e);
                        Coverage::new()
                    }
                }
            }
        };
        self.collected = parsed.difference(&self.ignored);
    }

    fn exec_target(&mut self, argv: &[String], timeout: Duration) -> anyhow::Result<RunResult> {
        let (prog, args) = argv.split_first().context("empty target command line")?;
        self.reset_channel();

        let mut child = Command::new(prog)
            .args(args)
            .env(COVERAGE_SHM_ENV, &self.shm_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn target {}", prog))?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait().context("failed to poll target")? {
                break Some(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                break None;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let result = match status {
            None => RunResult::Hang,
            Some(status) => match crash_signal(&status) {
                Some(sig) => {
                    self.last_crash = Some(signal_name(sig));
                    RunResult::Crash
                }
                None => RunResult::Ok,
            },
        };
        self.collect_channel();
        Ok(result)
    }
}

impl Instrumentation for CommandInstrumentation {
    fn run(
        &mut self,
        argv: &[String],
        init_timeout: Duration,
        timeout: Duration,
    ) -> anyhow::Result<RunResult> {
        let timeout = if self.has_run { timeout } else { init_timeout };
        self.has_run = true;
        self.exec_target(argv, timeout)
    }

    fn run_with_crash_analysis(
        &mut self,
        argv: &[String],
        init_timeout: Duration,
        timeout: Duration,
    ) -> anyhow::Result<RunResult> {
        self.run(argv, init_timeout, timeout)
    }

    fn coverage(&mut self, clear: bool) -> Coverage {
        if clear {
            std::mem::take(&mut self.collected)
        } else {
            self.collected.clone()
        }
    }

    fn clear_coverage(&mut self) {
        self.collected = Coverage::new();
    }

    fn crash_name(&self) -> String {
        self.last_crash.clone().unwrap_or_else(|| "unknown".to_string())
    }

    fn ignore_coverage(&mut self, coverage: &Coverage) {
        self.ignored.merge(coverage);
    }

    fn clean_target(&mut self) {
        // the target is a fresh process every run; only the channel can
        // hold stale state
        self.reset_channel();
        self.collected = Coverage::new();
    }
}

#[cfg(unix)]
fn crash_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn crash_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(unix)]
fn signal_name(sig: i32) -> String {
    nix::sys::signal::Signal::try_from(sig)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal_{}", sig))
}

#[cfg(not(unix))]
fn signal_name(sig: i32) -> String {
    format!("signal_{}", sig)
}

/// Writes the sample where the target's `@@` argument points.
pub struct FileDelivery {
    path: PathBuf,
}

impl FileDelivery {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SampleDelivery for FileDelivery {
    fn deliver(&mut self, sample: &Sample) -> anyhow::Result<()> {
        fs::write(&self.path, sample.bytes())
            .with_context(|| format!("failed to write sample to {}", self.path.display()))
    }
}

/// Writes `u32 size` + bytes into a named shared memory region the
/// target maps by the name `@@` was rewritten to.
pub struct ShmemDelivery {
    shm: Shmem,
}

impl ShmemDelivery {
    pub fn new(shm_id: &str) -> anyhow::Result<Self> {
        let shm = create_shm(shm_id, MAX_SAMPLE_SIZE + 4)?;
        Ok(Self { shm })
    }
}

impl SampleDelivery for ShmemDelivery {
    fn deliver(&mut self, sample: &Sample) -> anyhow::Result<()> {
        if sample.size() + 4 > self.shm.len() {
            bail!("sample does not fit the shared memory region");
        }
        unsafe {
            let base = self.shm.as_ptr();
            let size = (sample.size() as u32).to_le_bytes();
            ptr::copy_nonoverlapping(size.as_ptr(), base, 4);
            ptr::copy_nonoverlapping(sample.bytes().as_ptr(), base.add(4), sample.size());
        }
        Ok(())
    }
}

pub fn create_shm(id: &str, size: usize) -> anyhow::Result<Shmem> {
    match ShmemConf::new().os_id(id).size(size).create() {
        Ok(mut shm) => {
            shm.set_owner(true);
            Ok(shm)
        }
        Err(ShmemError::MappingIdExists) => {
            let mut shm = ShmemConf::new()
                .os_id(id)
                .size(size)
                .open()
                .with_context(|| format!("failed to open existing shared memory {}", id))?;
            shm.set_owner(true);
            Ok(shm)
        }
        Err(e) => Err(e).with_context(|| format!("failed to create shared memory {}", id)),
    }
}

/// Replace every occurrence of `needle` in the target command line,
/// giving each worker its own copy of the rewritten argv.
pub fn rewrite_placeholder(argv: &mut [String], needle: &str, replacement: &str) {
    for arg in argv.iter_mut() {
        if arg == needle {
            *arg = replacement.to_string();
        }
    }
}
