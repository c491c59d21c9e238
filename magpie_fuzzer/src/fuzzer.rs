//! The fuzzing coordinator: shared session state, the per-worker job
//! protocol, and the run/trim/retain pipeline every sample goes
//! through.
//!
//! Locks are coarse and never held across target execution. Nesting
//! orders used here and in the checkpoint code: output → coverage →
//! queue, and server → coverage.

use crate::config::Config;
use crate::crash::{sanitize_crash_name, CrashManager, CRASH_REPRODUCE_TIMES, MAX_IDENTICAL_CRASHES};
use crate::exec::{Instrumentation, RunResult, SampleDelivery};
use crate::filter::OutputFilter;
use crate::server::CoverageClient;
use crate::stats::Stats;
use anyhow::{bail, Context};
use magpie_core::corpus::{SampleQueue, SampleQueueEntry};
use magpie_core::coverage::Coverage;
use magpie_core::mutation::ByteMutator;
use magpie_core::sample::Sample;
use magpie_core::{RngType, MAX_SAMPLE_SIZE};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Retries used to split a sample's coverage into stable and variable
/// parts; the initial run counts too, so stable coverage is the
/// intersection over `SAMPLE_RETRY_TIMES + 1` executions.
pub const SAMPLE_RETRY_TIMES: usize = 4;
pub const TRIM_STEP_INITIAL: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    InputSampleProcessing,
    ServerSampleProcessing,
    Fuzzing,
}

/// Everything guarded by the queue lock.
pub struct QueueState {
    pub all_samples: Vec<Arc<Sample>>,
    pub sample_queue: SampleQueue,
    pub input_files: VecDeque<PathBuf>,
    pub server_samples: VecDeque<Sample>,
    /// Jobs handed out but not yet returned through `job_done`.
    pub samples_pending: u64,
    pub state: CoordinatorState,
    /// Minimum priority ever popped; restored entries are seeded with
    /// it.
    pub min_priority: f64,
    pub last_server_update: Instant,
    pub num_samples_discarded: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            all_samples: Vec::new(),
            sample_queue: SampleQueue::new(),
            input_files: VecDeque::new(),
            server_samples: VecDeque::new(),
            samples_pending: 0,
            state: CoordinatorState::InputSampleProcessing,
            min_priority: f64::MAX,
            last_server_update: Instant::now(),
            num_samples_discarded: 0,
        }
    }
}

/// Guarded by the output lock along with every write under `out_dir`.
pub struct OutputState {
    pub num_samples: u64,
}

/// Worker-local collaborators; each worker owns its own target argv,
/// PRNG, mutator, delivery channel, and instrumentation.
pub struct Worker {
    pub id: u64,
    pub target_argv: Vec<String>,
    pub rng: RngType,
    pub mutator: ByteMutator,
    pub instrumentation: Box<dyn Instrumentation>,
    pub delivery: Box<dyn SampleDelivery>,
    pub output_filter: Option<Box<dyn OutputFilter>>,
    /// Snapshot of `all_samples`, grown under the queue lock on each
    /// job request.
    pub all_samples_local: Vec<Arc<Sample>>,
}

pub enum Job {
    Wait,
    ProcessSample(Sample),
    Fuzz(Box<SampleQueueEntry>),
}

pub enum JobOutcome {
    Wait,
    ProcessSample,
    Fuzz { entry: Box<SampleQueueEntry>, discard: bool },
}

pub struct Fuzzer {
    pub config: Config,
    pub stats: Stats,
    pub crashes: CrashManager,
    pub queue: Mutex<QueueState>,
    pub coverage: Mutex<Coverage>,
    pub output: Mutex<OutputState>,
    pub server: Option<Mutex<CoverageClient>>,
}

impl Fuzzer {
    pub fn new(config: Config) -> Self {
        let server = config
            .server_addr
            .as_ref()
            .map(|addr| Mutex::new(CoverageClient::new(addr.clone())));
        Self {
            stats: Stats::new(),
            crashes: CrashManager::new(MAX_IDENTICAL_CRASHES),
            queue: Mutex::new(QueueState::new()),
            coverage: Mutex::new(Coverage::new()),
            output: Mutex::new(OutputState { num_samples: 0 }),
            server,
            config,
        }
    }

    /// Workers never terminate except by process exit.
    pub fn worker_loop(&self, w: &mut Worker) -> anyhow::Result<()> {
        loop {
            match self.synchronize_and_get_job(w)? {
                Job::Wait => {
                    std::thread::sleep(Duration::from_secs(1));
                    self.job_done(JobOutcome::Wait);
                }
                Job::ProcessSample(mut sample) => {
                    self.run_sample(w, &mut sample, false, false, self.config.corpus_timeout)?;
                    self.job_done(JobOutcome::ProcessSample);
                }
                Job::Fuzz(mut entry) => {
                    let discard = self.fuzz_one(w, &mut entry)?;
                    self.job_done(JobOutcome::Fuzz { entry, discard });
                }
            }
        }
    }

    /// Advance the coordinator state machine and hand out the next job.
    pub fn synchronize_and_get_job(&self, w: &mut Worker) -> anyhow::Result<Job> {
        let mut qs = self.queue.lock().unwrap();

        // pick up samples other workers retained since last time
        if qs.all_samples.len() > w.all_samples_local.len() {
            let old_len = w.all_samples_local.len();
            w.all_samples_local
                .extend(qs.all_samples[old_len..].iter().cloned());
        }

        if qs.state == CoordinatorState::Fuzzing
            && self.server.is_some()
            && qs.last_server_update.elapsed() >= self.config.server_update_interval
        {
            qs.last_server_update = Instant::now();
            self.server_pull(&mut qs);
            qs.state = CoordinatorState::ServerSampleProcessing;
        }

        if qs.state == CoordinatorState::InputSampleProcessing
            && qs.input_files.is_empty()
            && qs.samples_pending == 0
        {
            if qs.sample_queue.is_empty() {
                bail!("no interesting input files");
            }
            if self.server.is_some() {
                self.server_push_ledger();
                qs.last_server_update = Instant::now();
                self.server_pull(&mut qs);
                qs.state = CoordinatorState::ServerSampleProcessing;
            } else {
                qs.state = CoordinatorState::Fuzzing;
            }
        }

        if qs.state == CoordinatorState::ServerSampleProcessing
            && qs.server_samples.is_empty()
            && qs.samples_pending == 0
        {
            qs.state = CoordinatorState::Fuzzing;
        }

        let job = match qs.state {
            CoordinatorState::Fuzzing => match qs.sample_queue.pop() {
                None => Job::Wait,
                Some(entry) => {
                    if entry.priority < qs.min_priority {
                        qs.min_priority = entry.priority;
                    }
                    Job::Fuzz(entry)
                }
            },
            CoordinatorState::InputSampleProcessing => match qs.input_files.pop_front() {
                None => Job::Wait,
                Some(path) => {
                    worker_info!("running input sample {}", path.display());
                    let mut sample = Sample::load(&path).with_context(|| {
                        format!("failed to load input sample {}", path.display())
                    })?;
                    if sample.size() > MAX_SAMPLE_SIZE {
                        worker_warn!(
                            "input sample larger than {} bytes, trimming",
                            MAX_SAMPLE_SIZE
                        );
                        sample.trim(MAX_SAMPLE_SIZE);
                    }
                    qs.samples_pending += 1;
                    Job::ProcessSample(sample)
                }
            },
            CoordinatorState::ServerSampleProcessing => match qs.server_samples.pop_front() {
                None => Job::Wait,
                Some(sample) => {
                    qs.samples_pending += 1;
                    Job::ProcessSample(sample)
                }
            },
        };
        Ok(job)
    }

    pub fn job_done(&self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Wait => {}
            JobOutcome::ProcessSample => {
                let mut qs = self.queue.lock().unwrap();
                qs.samples_pending -= 1;
            }
            JobOutcome::Fuzz { entry, discard } => {
                let mut qs = self.queue.lock().unwrap();
                if discard {
                    qs.num_samples_discarded += 1;
                    drop(entry);
                } else {
                    qs.sample_queue.push(entry);
                }
            }
        }
    }

    /// One fuzzing round over a checked-out corpus entry. Returns true
    /// when the entry produced so many hangs or crashes it should be
    /// dropped from the corpus.
    pub fn fuzz_one(&self, w: &mut Worker, entry: &mut SampleQueueEntry) -> anyhow::Result<bool> {
        let mut ctx = match entry.context.take() {
            Some(ctx) => ctx,
            None => w.mutator.create_context(&entry.sample),
        };
        w.mutator.init_round(&entry.sample, &mut ctx);

        worker_trace!("fuzzing sample {:05}", entry.sample_index);

        let mut discard = false;
        loop {
            let mut mutated = (*entry.sample).clone();
            if !w
                .mutator
                .mutate(&mut mutated, &mut ctx, &mut w.rng, &w.all_samples_local)
            {
                break;
            }
            if mutated.size() > MAX_SAMPLE_SIZE {
                mutated.trim(MAX_SAMPLE_SIZE);
            }

            let (result, has_new_coverage) =
                self.run_sample(w, &mut mutated, true, true, self.config.timeout)?;
            if has_new_coverage {
                entry.priority = 0.0;
            } else {
                entry.priority -= 1.0;
            }
            w.mutator.notify_result(&mut ctx, has_new_coverage);

            entry.num_runs += 1;
            if has_new_coverage {
                entry.num_newcoverage += 1;
            }
            if result == RunResult::Hang {
                entry.num_hangs += 1;
            }
            if result == RunResult::Crash {
                entry.num_crashes += 1;
            }

            if entry.num_hangs > 10
                && entry.num_hangs as f64 > entry.num_runs as f64 * self.config.acceptable_hang_ratio
            {
                worker_warn!(
                    "sample {:05} produces too many hangs, discarding",
                    entry.sample_index
                );
                discard = true;
                break;
            }
            if entry.num_crashes > 100
                && entry.num_crashes as f64
                    > entry.num_runs as f64 * self.config.acceptable_crash_ratio
            {
                worker_warn!(
                    "sample {:05} produces too many crashes, discarding",
                    entry.sample_index
                );
                discard = true;
                break;
            }
        }

        entry.context = Some(ctx);
        Ok(discard)
    }

    /// Execute `sample` once: deliver, run, collect coverage, and route
    /// crashes and hangs into preservation.
    pub fn run_sample_and_get_coverage(
        &self,
        w: &mut Worker,
        sample: &Sample,
        timeout: Duration,
    ) -> anyhow::Result<(RunResult, Coverage)> {
        // unprotected counter; small drift is acceptable
        self.stats.inc_execs();

        self.deliver_with_retry(w, sample)?;

        let result = w
            .instrumentation
            .run(&w.target_argv, self.config.init_timeout, timeout)?;
        let coverage = w.instrumentation.coverage(true);

        if result == RunResult::Crash {
            self.handle_crash(w, sample, timeout)?;
        }
        if result == RunResult::Hang {
            let hang_id = self.stats.inc_hangs();
            if self.config.save_hangs {
                let _output = self.output.lock().unwrap();
                let path = self.config.hangs_dir().join(format!("hang_{}", hang_id));
                sample
                    .save(&path)
                    .with_context(|| format!("failed to save hang {}", path.display()))?;
            }
        }

        Ok((result, coverage))
    }

    fn deliver_with_retry(&self, w: &mut Worker, sample: &Sample) -> anyhow::Result<()> {
        if let Err(e) = w.delivery.deliver(sample) {
            worker_warn!("error delivering sample, retrying with a clean target: {}", e);
            w.instrumentation.clean_target();
            w.delivery
                .deliver(sample)
                .context("repeatedly failed to deliver sample")?;
        }
        Ok(())
    }

    fn handle_crash(&self, w: &mut Worker, sample: &Sample, timeout: Duration) -> anyhow::Result<()> {
        let mut crash_desc = w.instrumentation.crash_name();
        if self.try_reproduce_crash(w, sample, timeout)? == RunResult::Crash {
            // a hopefully better name from the reproducing run
            crash_desc = w.instrumentation.crash_name();
        } else {
            crash_desc = format!("flaky_{}", crash_desc);
        }

        if let Some(duplicate) = self.crashes.register(&crash_desc) {
            let filename = format!("{}_{}", sanitize_crash_name(&crash_desc), duplicate);
            {
                let _output = self.output.lock().unwrap();
                let path = self.config.crash_dir().join(&filename);
                sample
                    .save(&path)
                    .with_context(|| format!("failed to save crash {}", path.display()))?;
            }
            if let Some(server) = self.server.as_ref() {
                let mut server = server.lock().unwrap();
                if let Err(e) = server.report_crash(sample, &crash_desc) {
                    log::warn!("failed to report crash to server: {}", e);
                }
            }
        }
        Ok(())
    }

    fn try_reproduce_crash(
        &self,
        w: &mut Worker,
        sample: &Sample,
        timeout: Duration,
    ) -> anyhow::Result<RunResult> {
        let mut result = RunResult::Other;
        for _ in 0..CRASH_REPRODUCE_TIMES {
            self.stats.inc_execs();
            self.deliver_with_retry(w, sample)?;
            result = w.instrumentation.run_with_crash_analysis(
                &w.target_argv,
                self.config.init_timeout,
                timeout,
            )?;
            w.instrumentation.clear_coverage();
            if result == RunResult::Crash {
                return Ok(result);
            }
        }
        Ok(result)
    }

    /// The full per-sample protocol: execute, retry to split stable
    /// from variable coverage, consult the interest filter, and if the
    /// sample earned its place, trim it, persist it, and publish it to
    /// the corpus. Returns the run result and whether new stable
    /// coverage was found.
    pub fn run_sample(
        &self,
        w: &mut Worker,
        sample: &mut Sample,
        trim: bool,
        report_to_server: bool,
        timeout: Duration,
    ) -> anyhow::Result<(RunResult, bool)> {
        let mut filtered;
        let sample = match w.output_filter.as_ref().and_then(|f| f.filter(sample)) {
            Some(transformed) => {
                filtered = transformed;
                &mut filtered
            }
            None => sample,
        };

        let (result, initial_coverage) = self.run_sample_and_get_coverage(w, sample, timeout)?;
        if result != RunResult::Ok || initial_coverage.is_empty() {
            return Ok((result, false));
        }

        // the sample surfaced coverage we have not ignored yet; re-run
        // it against a clean target to find out which part is stable
        w.instrumentation.clean_target();

        let mut stable_coverage = initial_coverage.clone();
        let mut total_coverage = initial_coverage;
        for _ in 0..SAMPLE_RETRY_TIMES {
            let (result, retry_coverage) = self.run_sample_and_get_coverage(w, sample, timeout)?;
            if result != RunResult::Ok {
                return Ok((result, false));
            }
            total_coverage.merge(&retry_coverage);
            stable_coverage = stable_coverage.intersection(&retry_coverage);
        }
        // offsets seen in some runs but not all
        let mut variable_coverage = total_coverage.difference(&stable_coverage);

        let interesting = self.interesting_sample(&mut stable_coverage, &mut variable_coverage);
        if interesting {
            if trim {
                self.trim_sample(w, sample, &stable_coverage, timeout)?;
            }

            let sample_index = {
                let mut output = self.output.lock().unwrap();
                let index = output.num_samples;
                let path = self.config.sample_path(index);
                sample
                    .save(&path)
                    .with_context(|| format!("failed to save sample {}", path.display()))?;
                output.num_samples += 1;
                index
            };

            if report_to_server {
                if let Some(server) = self.server.as_ref() {
                    let mut server = server.lock().unwrap();
                    if let Err(e) = server.report_new_coverage(&stable_coverage, Some(sample)) {
                        log::warn!("failed to report new coverage to server: {}", e);
                    }
                }
            }

            let retained = Arc::new(sample.clone());
            let mut entry = Box::new(SampleQueueEntry::new(Arc::clone(&retained), sample_index));
            entry.context = Some(w.mutator.create_context(&retained));
            {
                let mut qs = self.queue.lock().unwrap();
                qs.all_samples.push(retained);
                qs.sample_queue.push(entry);
            }
        }

        if !variable_coverage.is_empty() && report_to_server {
            if let Some(server) = self.server.as_ref() {
                let mut server = server.lock().unwrap();
                // the server should see flaky offsets but must not
                // distribute a sample for them
                if let Err(e) = server.report_new_coverage(&variable_coverage, None) {
                    log::warn!("failed to report variable coverage to server: {}", e);
                }
            }
        }

        // subsequent runs only report offsets beyond this sample's
        w.instrumentation.ignore_coverage(&total_coverage);

        Ok((RunResult::Ok, interesting))
    }

    /// Fold a run's stable/variable split into the ledger. On return
    /// the caller's sets hold only the offsets the ledger had not seen,
    /// and the sample is interesting iff the new stable part is
    /// nonempty.
    pub fn interesting_sample(&self, stable: &mut Coverage, variable: &mut Coverage) -> bool {
        let mut ledger = self.coverage.lock().unwrap();
        let new_stable = stable.difference(&ledger);
        let new_variable = variable.difference(&ledger);
        ledger.merge(&new_stable);
        ledger.merge(&new_variable);
        drop(ledger);

        *stable = new_stable;
        *variable = new_variable;
        !stable.is_empty()
    }

    /// Shrink `sample` to the smallest prefix whose coverage still
    /// contains `stable_coverage`, halving the step on every failed
    /// cut. Any non-OK run aborts the search at the last accepted size.
    pub fn trim_sample(
        &self,
        w: &mut Worker,
        sample: &mut Sample,
        stable_coverage: &Coverage,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        if sample.size() <= 1 {
            return Ok(());
        }

        let mut trim_step = TRIM_STEP_INITIAL;
        let mut trimmed_size = sample.size();
        let mut test_sample = sample.clone();

        loop {
            if test_sample.size() <= 1 {
                break;
            }
            while trim_step >= test_sample.size() {
                trim_step /= 2;
            }
            if trim_step == 0 {
                break;
            }
            test_sample.trim(test_sample.size() - trim_step);

            let (result, test_coverage) =
                self.run_sample_and_get_coverage(w, &test_sample, timeout)?;
            if result != RunResult::Ok {
                break;
            }
            if !test_coverage.contains(stable_coverage) {
                trim_step /= 2;
                if trim_step == 0 {
                    break;
                }
                test_sample = sample.clone();
                test_sample.trim(trimmed_size);
                continue;
            }
            trimmed_size = test_sample.size();
        }

        if trimmed_size < sample.size() {
            sample.trim(trimmed_size);
        }
        Ok(())
    }

    /// Push the whole ledger to the server. RPC failures are logged and
    /// the session continues offline until the next sync.
    fn server_push_ledger(&self) {
        if let Some(server) = self.server.as_ref() {
            let mut server = server.lock().unwrap();
            let ledger = self.coverage.lock().unwrap();
            if let Err(e) = server.report_new_coverage(&ledger, None) {
                log::warn!("failed to push coverage to server: {}", e);
            }
        }
    }

    fn server_pull(&self, qs: &mut QueueState) {
        if let Some(server) = self.server.as_ref() {
            let mut server = server.lock().unwrap();
            if let Err(e) = server.get_updates(&mut qs.server_samples, self.stats.execs()) {
                log::warn!("failed to pull server updates: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::cell::RefCell;
    use std::fs;
    use std::rc::Rc;

    fn cov(pairs: &[(&str, &[u64])]) -> Coverage {
        let mut c = Coverage::new();
        for (module, offsets) in pairs {
            for offset in offsets.iter() {
                c.insert(module, *offset);
            }
        }
        c
    }

    #[derive(Default)]
    struct SharedTarget {
        delivered: RefCell<Vec<u8>>,
    }

    struct MemDelivery(Rc<SharedTarget>);

    impl SampleDelivery for MemDelivery {
        fn deliver(&mut self, sample: &Sample) -> anyhow::Result<()> {
            *self.0.delivered.borrow_mut() = sample.bytes().to_vec();
            Ok(())
        }
    }

    type Behavior = Box<dyn FnMut(&[u8]) -> (RunResult, Coverage)>;

    struct TestInstrumentation {
        target: Rc<SharedTarget>,
        behavior: Behavior,
        ignored: Coverage,
        collected: Coverage,
        crash_name: String,
    }

    impl Instrumentation for TestInstrumentation {
        fn run(
            &mut self,
            _argv: &[String],
            _init_timeout: Duration,
            _timeout: Duration,
        ) -> anyhow::Result<RunResult> {
            let (result, coverage) = (self.behavior)(&self.target.delivered.borrow());
            self.collected = coverage.difference(&self.ignored);
            Ok(result)
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
            self.crash_name.clone()
        }

        fn ignore_coverage(&mut self, coverage: &Coverage) {
            self.ignored.merge(coverage);
        }

        fn clean_target(&mut self) {}
    }

    fn test_worker(behavior: Behavior) -> Worker {
        let target = Rc::new(SharedTarget::default());
        Worker {
            id: 1,
            target_argv: Vec::new(),
            rng: RngType::seed_from_u64(7),
            mutator: ByteMutator::new(),
            instrumentation: Box::new(TestInstrumentation {
                target: Rc::clone(&target),
                behavior,
                ignored: Coverage::new(),
                collected: Coverage::new(),
                crash_name: "SIGSEGV_x".to_string(),
            }),
            delivery: Box::new(MemDelivery(target)),
            output_filter: None,
            all_samples_local: Vec::new(),
        }
    }

    fn test_fuzzer(tag: &str) -> Fuzzer {
        let out_dir = std::env::temp_dir().join(format!("magpie_{}_{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&out_dir);
        let config = Config {
            out_dir,
            timeout: Duration::from_secs(1),
            init_timeout: Duration::from_secs(1),
            corpus_timeout: Duration::from_secs(1),
            ..Config::default()
        };
        for dir in [config.crash_dir(), config.hangs_dir(), config.sample_dir()] {
            fs::create_dir_all(dir).unwrap();
        }
        Fuzzer::new(config)
    }

    fn cleanup(fuzzer: &Fuzzer) {
        let _ = fs::remove_dir_all(&fuzzer.config.out_dir);
    }

    #[test]
    fn seeds_flow_into_corpus() {
        let fuzzer = test_fuzzer("seeds");
        let in_dir = fuzzer.config.out_dir.join("in");
        fs::create_dir_all(&in_dir).unwrap();
        fs::write(in_dir.join("a"), b"AAAA").unwrap();
        fs::write(in_dir.join("b"), b"BBBB").unwrap();
        {
            let mut qs = fuzzer.queue.lock().unwrap();
            qs.input_files.push_back(in_dir.join("a"));
            qs.input_files.push_back(in_dir.join("b"));
        }

        // both seeds exercise the same locations; only the first is new
        let mut w = test_worker(Box::new(|_| (RunResult::Ok, cov(&[("t", &[10, 20])]))));

        for _ in 0..2 {
            match fuzzer.synchronize_and_get_job(&mut w).unwrap() {
                Job::ProcessSample(mut sample) => {
                    fuzzer
                        .run_sample(&mut w, &mut sample, false, false, Duration::from_secs(1))
                        .unwrap();
                    fuzzer.job_done(JobOutcome::ProcessSample);
                }
                _ => panic!("expected a process-sample job"),
            }
        }

        // backlog drained: the coordinator moves to fuzzing and hands
        // the retained seed back out
        match fuzzer.synchronize_and_get_job(&mut w).unwrap() {
            Job::Fuzz(entry) => {
                assert_eq!(entry.sample_index, 0);
                assert_eq!(entry.sample.bytes(), b"AAAA");
                assert_eq!(fuzzer.queue.lock().unwrap().min_priority, 0.0);
                fuzzer.job_done(JobOutcome::Fuzz {
                    entry,
                    discard: false,
                });
            }
            _ => panic!("expected a fuzz job"),
        }

        assert_eq!(fuzzer.output.lock().unwrap().num_samples, 1);
        assert_eq!(
            fs::read(fuzzer.config.sample_path(0)).unwrap(),
            b"AAAA".to_vec()
        );
        assert!(!fuzzer.config.sample_path(1).exists());
        cleanup(&fuzzer);
    }

    #[test]
    fn empty_corpus_after_ingestion_is_fatal() {
        let fuzzer = test_fuzzer("nocorpus");
        let mut w = test_worker(Box::new(|_| (RunResult::Ok, Coverage::new())));
        assert!(fuzzer.synchronize_and_get_job(&mut w).is_err());
        cleanup(&fuzzer);
    }

    #[test]
    fn empty_queue_yields_wait() {
        let fuzzer = test_fuzzer("wait");
        fuzzer.queue.lock().unwrap().state = CoordinatorState::Fuzzing;
        let mut w = test_worker(Box::new(|_| (RunResult::Ok, Coverage::new())));
        assert!(matches!(
            fuzzer.synchronize_and_get_job(&mut w).unwrap(),
            Job::Wait
        ));
        cleanup(&fuzzer);
    }

    #[test]
    fn interest_filter_returns_only_deltas() {
        let fuzzer = test_fuzzer("interest");
        fuzzer.coverage.lock().unwrap().merge(&cov(&[("t", &[1])]));

        let mut stable = cov(&[("t", &[1, 2])]);
        let mut variable = cov(&[("t", &[3])]);
        assert!(fuzzer.interesting_sample(&mut stable, &mut variable));
        assert_eq!(stable, cov(&[("t", &[2])]));
        assert_eq!(variable, cov(&[("t", &[3])]));
        {
            let ledger = fuzzer.coverage.lock().unwrap();
            assert!(ledger.contains(&cov(&[("t", &[1, 2, 3])])));
        }

        // a second sighting of the same offsets is no longer interesting
        let mut stable = cov(&[("t", &[1, 2])]);
        let mut variable = cov(&[("t", &[3])]);
        assert!(!fuzzer.interesting_sample(&mut stable, &mut variable));
        assert!(stable.is_empty());
        assert!(variable.is_empty());
        cleanup(&fuzzer);
    }

    #[test]
    fn crash_dedup_caps_saved_files() {
        let mut fuzzer = test_fuzzer("crashdedup");
        fuzzer.crashes = CrashManager::new(3);
        let mut w = test_worker(Box::new(|_| (RunResult::Crash, Coverage::new())));
        let sample = Sample::new(b"crashy".to_vec());

        for _ in 0..5 {
            let (result, _) = fuzzer
                .run_sample_and_get_coverage(&mut w, &sample, Duration::from_secs(1))
                .unwrap();
            assert_eq!(result, RunResult::Crash);
        }

        assert_eq!(fuzzer.crashes.num_crashes(), 5);
        assert_eq!(fuzzer.crashes.num_unique_crashes(), 1);
        for k in 1..=3u32 {
            assert!(fuzzer
                .config
                .crash_dir()
                .join(format!("SIGSEGV_x_{}", k))
                .exists());
        }
        assert!(!fuzzer
            .config
            .crash_dir()
            .join("SIGSEGV_x_4")
            .exists());
        cleanup(&fuzzer);
    }

    #[test]
    fn unreproducible_crash_is_flaky() {
        let fuzzer = test_fuzzer("flaky");
        let mut calls = 0u32;
        let mut w = test_worker(Box::new(move |_| {
            calls += 1;
            if calls == 1 {
                (RunResult::Crash, Coverage::new())
            } else {
                (RunResult::Ok, Coverage::new())
            }
        }));
        let sample = Sample::new(b"flaky".to_vec());
        let (result, _) = fuzzer
            .run_sample_and_get_coverage(&mut w, &sample, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, RunResult::Crash);
        assert!(fuzzer
            .config
            .crash_dir()
            .join("flaky_SIGSEGV_x_1")
            .exists());
        assert_eq!(fuzzer.crashes.num_unique_crashes(), 1);
        cleanup(&fuzzer);
    }

    #[test]
    fn trims_to_smallest_covering_prefix() {
        let fuzzer = test_fuzzer("trim");
        // coverage depends only on the first 100 bytes being present
        let mut w = test_worker(Box::new(|data: &[u8]| {
            if data.len() >= 100 {
                (RunResult::Ok, cov(&[("t", &[1])]))
            } else {
                (RunResult::Ok, Coverage::new())
            }
        }));

        let mut sample = Sample::new(vec![0xA5; 1024]);
        let (result, interesting) = fuzzer
            .run_sample(&mut w, &mut sample, true, false, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, RunResult::Ok);
        assert!(interesting);
        assert_eq!(sample.size(), 100);

        let saved = fs::read(fuzzer.config.sample_path(0)).unwrap();
        assert_eq!(saved.len(), 100);
        {
            let qs = fuzzer.queue.lock().unwrap();
            assert_eq!(qs.all_samples.len(), 1);
            assert_eq!(qs.all_samples[0].size(), 100);
        }
        cleanup(&fuzzer);
    }

    #[test]
    fn tiny_samples_are_not_trimmed() {
        let fuzzer = test_fuzzer("trimtiny");
        let mut w = test_worker(Box::new(|_| (RunResult::Ok, cov(&[("t", &[1])]))));
        let mut sample = Sample::new(vec![7]);
        fuzzer
            .trim_sample(&mut w, &mut sample, &cov(&[("t", &[1])]), Duration::from_secs(1))
            .unwrap();
        assert_eq!(sample.size(), 1);
        // no executions were spent on it
        assert_eq!(fuzzer.stats.execs(), 0);
        cleanup(&fuzzer);
    }

    #[test]
    fn hang_heavy_entry_is_discarded() {
        let fuzzer = test_fuzzer("discard");
        let mut w = test_worker(Box::new(|_| (RunResult::Hang, Coverage::new())));

        let mut entry = Box::new(SampleQueueEntry::new(
            Arc::new(Sample::new(vec![0u8; 32])),
            0,
        ));
        let discard = fuzzer.fuzz_one(&mut w, &mut entry).unwrap();
        assert!(discard);
        assert_eq!(entry.num_runs, 11);
        assert_eq!(entry.num_hangs, 11);
        assert_eq!(fuzzer.stats.hangs(), 11);

        fuzzer.job_done(JobOutcome::Fuzz {
            entry,
            discard: true,
        });
        let qs = fuzzer.queue.lock().unwrap();
        assert_eq!(qs.num_samples_discarded, 1);
        assert!(qs.sample_queue.is_empty());
        drop(qs);
        cleanup(&fuzzer);
    }

    #[test]
    fn second_worker_sees_retained_samples() {
        let fuzzer = test_fuzzer("sync");
        let sample = Arc::new(Sample::new(b"seed".to_vec()));
        {
            let mut qs = fuzzer.queue.lock().unwrap();
            qs.all_samples.push(Arc::clone(&sample));
            qs.state = CoordinatorState::Fuzzing;
        }
        let mut w = test_worker(Box::new(|_| (RunResult::Ok, Coverage::new())));
        let _ = fuzzer.synchronize_and_get_job(&mut w).unwrap();
        assert_eq!(w.all_samples_local.len(), 1);
        assert_eq!(w.all_samples_local[0].bytes(), b"seed");
        cleanup(&fuzzer);
    }

    #[test]
    fn output_filter_reaches_the_target() {
        use crate::filter::MagicOutputFilter;

        let fuzzer = test_fuzzer("filter");
        // only correctly-prefixed inputs produce coverage
        let mut w = test_worker(Box::new(|data: &[u8]| {
            if data.starts_with(b"MAGI") {
                (RunResult::Ok, cov(&[("t", &[5])]))
            } else {
                (RunResult::Ok, Coverage::new())
            }
        }));
        w.output_filter = Some(Box::new(MagicOutputFilter::new(b"MAGI".to_vec())));

        let mut sample = Sample::new(b"xxxxrest".to_vec());
        let (result, interesting) = fuzzer
            .run_sample(&mut w, &mut sample, false, false, Duration::from_secs(1))
            .unwrap();
        assert_eq!(result, RunResult::Ok);
        assert!(interesting);
        // the retained corpus holds the delivered form, the caller's
        // sample is untouched
        assert_eq!(sample.bytes(), b"xxxxrest");
        assert_eq!(
            fs::read(fuzzer.config.sample_path(0)).unwrap(),
            b"MAGIrest".to_vec()
        );
        cleanup(&fuzzer);
    }
}
