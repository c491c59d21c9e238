use anyhow::bail;
use clap::ValueEnum;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How samples reach the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeliveryMode {
    File,
    Shmem,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Seed input directory; `-` leaves the backlog empty and forces a
    /// state restore.
    pub in_dir: String,
    pub out_dir: PathBuf,
    pub num_threads: u64,
    /// Per-execution timeout.
    pub timeout: Duration,
    /// Timeout for the first execution of a target instance.
    pub init_timeout: Duration,
    /// Timeout used while ingesting seed inputs.
    pub corpus_timeout: Duration,
    pub restore: bool,
    pub server_addr: Option<String>,
    pub delivery: DeliveryMode,
    pub save_hangs: bool,
    pub acceptable_hang_ratio: f64,
    pub acceptable_crash_ratio: f64,
    pub server_update_interval: Duration,
    /// Target command line; `@@` is rewritten per worker to the
    /// delivery path or shared memory name.
    pub target_argv: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            in_dir: "-".to_string(),
            out_dir: PathBuf::from("out"),
            num_threads: 1,
            timeout: Duration::from_millis(0x7FFF_FFFF),
            init_timeout: Duration::from_millis(0x7FFF_FFFF),
            corpus_timeout: Duration::from_millis(0x7FFF_FFFF),
            restore: false,
            server_addr: None,
            delivery: DeliveryMode::File,
            save_hangs: false,
            acceptable_hang_ratio: 0.01,
            acceptable_crash_ratio: 0.02,
            server_update_interval: Duration::from_secs(5 * 60),
            target_argv: Vec::new(),
        }
    }
}

impl Config {
    pub fn check(&self) -> anyhow::Result<()> {
        if self.num_threads == 0 {
            bail!("need at least one worker thread");
        }
        if self.in_dir != "-" && !Path::new(&self.in_dir).is_dir() {
            bail!("bad input dir: {}", self.in_dir);
        }
        if self.out_dir.exists() && !self.out_dir.is_dir() {
            bail!("'{}' not a directory", self.out_dir.display());
        }
        if self.target_argv.is_empty() {
            bail!("no target command line, pass it after --");
        }
        Ok(())
    }

    pub fn crash_dir(&self) -> PathBuf {
        self.out_dir.join("crashes")
    }

    pub fn hangs_dir(&self) -> PathBuf {
        self.out_dir.join("hangs")
    }

    pub fn sample_dir(&self) -> PathBuf {
        self.out_dir.join("samples")
    }

    pub fn state_file(&self) -> PathBuf {
        self.out_dir.join("state.dat")
    }

    pub fn sample_path(&self, index: u64) -> PathBuf {
        self.sample_dir().join(format!("sample_{:05}", index))
    }
}
