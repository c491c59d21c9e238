//! magpie: a coverage-guided mutational fuzzer.
//!
//! One control thread drives checkpointing and stats; worker threads
//! pull jobs from the shared coordinator, mutate corpus entries, run
//! the target under instrumentation, and retain whatever grows the
//! coverage ledger.

#[macro_use]
pub mod worker_log;
pub mod config;
pub mod crash;
pub mod exec;
pub mod filter;
pub mod fuzzer;
pub mod server;
pub mod state;
pub mod stats;

use crate::config::{Config, DeliveryMode};
use crate::exec::{
    rewrite_placeholder, CommandInstrumentation, FileDelivery, SampleDelivery, ShmemDelivery,
};
use crate::fuzzer::{Fuzzer, Worker};
use anyhow::Context;
use magpie_core::mutation::ByteMutator;
use magpie_core::RngType;
use rand::SeedableRng;
use std::fs::create_dir_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Wall-clock seconds between checkpoint saves.
const SAVE_INTERVAL_SECS: u64 = 300;
/// Seconds between stats lines.
const REPORT_INTERVAL_SECS: u64 = 10;

pub fn boot(config: Config) -> anyhow::Result<()> {
    config.check().context("config error")?;
    println!("{}", BANNER);

    setup_directories(&config)?;
    let fuzzer = Arc::new(Fuzzer::new(config));

    if fuzzer.config.restore {
        fuzzer.restore_state().context("failed to restore state")?;
        let corpus = fuzzer.queue.lock().unwrap().sample_queue.len();
        log::info!(
            "restored {} corpus samples, {} execs",
            corpus,
            fuzzer.stats.execs()
        );
    } else {
        let files = list_input_files(&fuzzer.config.in_dir)?;
        if files.is_empty() {
            anyhow::bail!("no input files read from {}", fuzzer.config.in_dir);
        }
        log::info!("{} input files read", files.len());
        fuzzer.queue.lock().unwrap().input_files.extend(files);
    }

    for id in 1..=fuzzer.config.num_threads {
        let fuzzer = Arc::clone(&fuzzer);
        thread::Builder::new()
            .name(format!("magpie-worker-{}", id))
            .spawn(move || {
                worker_log::set_worker_id(id);
                let mut worker = match make_worker(&fuzzer, id) {
                    Ok(worker) => worker,
                    Err(e) => fatal(e),
                };
                if let Err(e) = fuzzer.worker_loop(&mut worker) {
                    fatal(e);
                }
            })
            .context("failed to spawn worker thread")?;
    }

    control_loop(&fuzzer)
}

/// There is no graceful shutdown: a worker hitting a fatal condition
/// takes the whole process down, and the session resumes from the last
/// checkpoint.
fn fatal(e: anyhow::Error) -> ! {
    let mut info = format!("worker-{} exits: {}", worker_log::worker_id(), e);
    for (i, cause) in e.chain().enumerate().skip(1) {
        info.push_str(&format!("\n\t{}. {}", i, cause));
    }
    log::error!("{}", info);
    std::process::exit(1);
}

fn control_loop(fuzzer: &Fuzzer) -> anyhow::Result<()> {
    let mut last_execs = 0u64;
    let mut secs_since_save = 0u64;
    let mut secs_since_report = 0u64;
    loop {
        thread::sleep(Duration::from_secs(1));
        secs_since_save += 1;
        secs_since_report += 1;

        if secs_since_save >= SAVE_INTERVAL_SECS {
            fuzzer.save_state().context("failed to save state")?;
            secs_since_save = 0;
        }

        if secs_since_report >= REPORT_INTERVAL_SECS {
            let num_offsets = fuzzer.coverage.lock().unwrap().num_offsets();
            let (corpus, discarded) = {
                let qs = fuzzer.queue.lock().unwrap();
                (qs.all_samples.len(), qs.num_samples_discarded)
            };
            let execs = fuzzer.stats.execs();
            log::info!(
                "execs: {} ({}/s), corpus: {} ({} discarded), crashes: {} ({} unique), hangs: {}, offsets: {}",
                execs,
                (execs - last_execs) / REPORT_INTERVAL_SECS,
                corpus,
                discarded,
                fuzzer.crashes.num_crashes(),
                fuzzer.crashes.num_unique_crashes(),
                fuzzer.stats.hangs(),
                num_offsets,
            );
            last_execs = execs;
            secs_since_report = 0;
        }
    }
}

fn setup_directories(config: &Config) -> anyhow::Result<()> {
    for dir in [
        config.out_dir.clone(),
        config.crash_dir(),
        config.hangs_dir(),
        config.sample_dir(),
    ] {
        create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    Ok(())
}

fn list_input_files(in_dir: &str) -> anyhow::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let dir_iter = std::fs::read_dir(in_dir)
        .with_context(|| format!("failed to read input dir {}", in_dir))?;
    for dent in dir_iter {
        let path = dent?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Build a worker's collaborators: its own argv copy with `@@`
/// rewritten, delivery channel, instrumentation, mutator, and PRNG.
fn make_worker(fuzzer: &Fuzzer, id: u64) -> anyhow::Result<Worker> {
    let config = &fuzzer.config;
    let mut target_argv = config.target_argv.clone();

    let instrumentation =
        CommandInstrumentation::new(id).context("failed to set up instrumentation")?;

    let delivery: Box<dyn SampleDelivery> = match config.delivery {
        DeliveryMode::File => {
            let path = config.out_dir.join(format!("input_{}", id));
            rewrite_placeholder(&mut target_argv, "@@", &path.display().to_string());
            Box::new(FileDelivery::new(path))
        }
        DeliveryMode::Shmem => {
            let shm_id = format!("magpie_input_{}_{}", std::process::id(), id);
            rewrite_placeholder(&mut target_argv, "@@", &shm_id);
            Box::new(ShmemDelivery::new(&shm_id).context("failed to set up shmem delivery")?)
        }
    };

    let mut worker = Worker {
        id,
        target_argv,
        rng: RngType::from_entropy(),
        mutator: ByteMutator::new(),
        instrumentation: Box::new(instrumentation),
        delivery,
        output_filter: None,
        all_samples_local: Vec::new(),
    };

    // seed the ignore set with everything the session has already seen
    {
        let ledger = fuzzer.coverage.lock().unwrap();
        worker.instrumentation.ignore_coverage(&ledger);
    }
    Ok(worker)
}

const BANNER: &str = r"
                          _
  _ __ ___   __ _  __ _ _ __ (_) ___
 | '_ ` _ \ / _` |/ _` | '_ \| |/ _ \
 | | | | | | (_| | (_| | |_) | |  __/
 |_| |_| |_|\__,_|\__, | .__/|_|\___|
                  |___/|_|
";
