//! Durable checkpoint: enough of the session to resume after the
//! process is killed. The format is explicit little-endian framing, so
//! a state file moves between architectures.

use crate::fuzzer::{CoordinatorState, Fuzzer};
use anyhow::Context;
use magpie_core::codec::{read_f64, read_u32, read_u64, write_f64, write_u32, write_u64};
use magpie_core::corpus::SampleQueueEntry;
use magpie_core::coverage::Coverage;
use magpie_core::sample::Sample;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;

const STATE_MAGIC: u32 = 0x4d41_4750;
const STATE_VERSION: u32 = 1;

impl Fuzzer {
    /// Serialize counters and the coverage ledger to `state.dat`.
    /// Skipped while seed ingestion is still running.
    pub fn save_state(&self) -> anyhow::Result<()> {
        let min_priority = {
            let qs = self.queue.lock().unwrap();
            if qs.state == CoordinatorState::InputSampleProcessing {
                return Ok(());
            }
            qs.min_priority
        };

        let output = self.output.lock().unwrap();
        let ledger = self.coverage.lock().unwrap();

        let path = self.config.state_file();
        let file = File::create(&path)
            .with_context(|| format!("failed to open state file {}", path.display()))?;
        let mut w = BufWriter::new(file);
        write_u32(&mut w, STATE_MAGIC)?;
        write_u32(&mut w, STATE_VERSION)?;
        write_u64(&mut w, output.num_samples)?;
        write_u64(&mut w, self.stats.execs())?;
        write_f64(&mut w, min_priority)?;
        ledger.write_to(&mut w)?;
        w.flush().context("failed to write state file")?;
        Ok(())
    }

    /// Rebuild counters, the ledger, and the corpus queue from
    /// `state.dat` plus the samples directory.
    pub fn restore_state(&self) -> anyhow::Result<()> {
        let mut output = self.output.lock().unwrap();
        let mut ledger = self.coverage.lock().unwrap();
        let mut qs = self.queue.lock().unwrap();

        let path = self.config.state_file();
        let file = File::open(&path).with_context(|| {
            format!(
                "failed to open state file {}, did the previous session run long enough to save it?",
                path.display()
            )
        })?;
        let mut r = BufReader::new(file);
        let magic = read_u32(&mut r)?;
        let version = read_u32(&mut r)?;
        if magic != STATE_MAGIC || version != STATE_VERSION {
            anyhow::bail!("state file {} has an unknown format", path.display());
        }
        let num_samples = read_u64(&mut r)?;
        let total_execs = read_u64(&mut r)?;
        let min_priority = read_f64(&mut r)?;
        *ledger = Coverage::read_from(&mut r).context("failed to decode coverage ledger")?;

        output.num_samples = num_samples;
        self.stats.set_execs(total_execs);
        qs.min_priority = min_priority;

        for index in 0..num_samples {
            let path = self.config.sample_path(index);
            let sample = Sample::load(&path)
                .with_context(|| format!("failed to load corpus sample {}", path.display()))?;
            let sample = Arc::new(sample);
            let mut entry = Box::new(SampleQueueEntry::new(Arc::clone(&sample), index));
            // per-sample priorities are not saved; every restored entry
            // starts at the historical minimum
            entry.priority = min_priority;
            qs.all_samples.push(sample);
            qs.sample_queue.push(entry);
        }
        Ok(())
    }
}
