use clap::Parser;
use env_logger::{Env, TimestampPrecision};
use magpie_fuzzer::config::{Config, DeliveryMode};
use magpie_fuzzer::{boot, server};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(version, about = "coverage-guided mutational fuzzer")]
struct Settings {
    /// Directory with seed inputs, or "-" to resume a previous session.
    #[arg(short = 'i', long = "in", required_unless_present = "start_server")]
    in_dir: Option<String>,
    /// Directory for corpus, crashes, hangs and session state.
    #[arg(short = 'o', long = "out")]
    out_dir: PathBuf,
    /// Parallel fuzzing threads.
    #[arg(long, default_value = "1")]
    nthreads: u64,
    /// Per-execution timeout in milliseconds.
    #[arg(short = 't', long = "timeout", default_value = "2147483647")]
    timeout: u64,
    /// Timeout for the first execution of a target instance; defaults
    /// to --timeout.
    #[arg(long = "t1")]
    init_timeout: Option<u64>,
    /// Timeout used while ingesting seed inputs; defaults to --timeout.
    #[arg(long = "t-corpus")]
    corpus_timeout: Option<u64>,
    /// Restore session state from the output directory.
    #[arg(long)]
    restore: bool,
    /// Alias of --restore.
    #[arg(long)]
    resume: bool,
    /// Address of the coverage server to synchronize with.
    #[arg(long)]
    server: Option<String>,
    /// Run only the coverage server and exit when it shuts down.
    #[arg(long)]
    start_server: bool,
    /// How samples reach the target.
    #[arg(long, value_enum, default_value = "file")]
    delivery: DeliveryMode,
    /// Target command line; "@@" is replaced per worker with the
    /// delivery path or shared memory name.
    #[arg(last = true)]
    target: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse();

    let log_env = Env::new()
        .filter_or("MAGPIE_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    let in_dir = settings.in_dir.unwrap_or_else(|| "-".to_string());
    let restore = settings.restore || settings.resume || in_dir == "-";
    let timeout = Duration::from_millis(settings.timeout);
    let config = Config {
        in_dir,
        out_dir: settings.out_dir,
        num_threads: settings.nthreads,
        timeout,
        init_timeout: settings
            .init_timeout
            .map(Duration::from_millis)
            .unwrap_or(timeout),
        corpus_timeout: settings
            .corpus_timeout
            .map(Duration::from_millis)
            .unwrap_or(timeout),
        restore,
        server_addr: settings.server,
        delivery: settings.delivery,
        target_argv: settings.target,
        ..Config::default()
    };

    if settings.start_server {
        return server::run_server(config);
    }
    boot(config)
}
