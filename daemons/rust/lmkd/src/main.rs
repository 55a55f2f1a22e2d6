// Copyright (c) The lmk Authors.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod activity;
mod control;
mod log_recorder;
mod proc_host;
mod reclaim;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use lmk_core::Host;
use lmk_core::IdleReason;
use lmk_core::LmkConfig;
use lmk_core::LowMemoryKiller;
use lmk_core::MonotonicClock;
use lmk_core::ShrinkControl;
use lmk_core::SoftReclaimConfig;
use lmk_core::MAX_VICTIM_SLOTS;
use log::debug;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::activity::ProcActivity;
use crate::log_recorder::LogRecorderBuilder;
use crate::proc_host::PriorityFile;
use crate::proc_host::ProcHost;
use crate::proc_host::ProcKiller;
use crate::reclaim::CgroupReclaim;

/// Pages handed to one shrinker call.
const SHRINK_BATCH: i64 = 128;

/// lmkd: userspace low-memory killer.
///
/// Watches free memory through procfs and kills the highest-priority,
/// largest processes once free memory drops below the floor configured for
/// their priority. While the system is idle it can also ask the kernel to
/// reclaim memory ahead of time through the cgroup v2 memory.reclaim
/// interface.
///
/// Thresholds are given as two parallel lists: --adj holds priority cutoffs
/// in oom_adj units (-17..=15) and --minfree the free-page floor at which
/// each cutoff becomes active. Runtime changes are written to the --control
/// file as `name=value` lines.
#[derive(Debug, Parser)]
struct Opts {
    /// JSON configuration file. Command-line values override its contents.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Priority thresholds, comma separated.
    #[clap(long, value_delimiter = ',', allow_hyphen_values = true)]
    adj: Vec<i32>,

    /// Free-page floors matching --adj, comma separated and ascending.
    #[clap(long, value_delimiter = ',')]
    minfree: Vec<u64>,

    /// How long a signalled victim blocks further kills, in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// Reclaim-pressure weight. Higher values make the shrinker emulation
    /// call the killer less often.
    #[clap(long)]
    cost: Option<i32>,

    /// Log gating level of the killer (0-5).
    #[clap(long)]
    debug_level: Option<u32>,

    /// Victims selected per pressure pass.
    #[clap(long, conflicts_with = "enhanced")]
    victim_slots: Option<usize>,

    /// Select up to three victims per pressure pass.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enhanced: bool,

    /// Per-process priority file to read.
    #[clap(long, value_enum, default_value = "score-adj")]
    priority: PriorityFile,

    /// Disable idle-time soft reclaim.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_soft_reclaim: bool,

    /// Pages requested per soft-reclaim attempt.
    #[clap(long)]
    nr_reclaim: Option<u64>,

    /// Free swap pages required before a soft-reclaim attempt.
    #[clap(long)]
    min_freeswap: Option<u64>,

    /// A soft-reclaim attempt reclaiming fewer pages cancels the request.
    #[clap(long)]
    min_reclaim: Option<u64>,

    /// Minimum time between soft-reclaim attempts, in milliseconds.
    #[clap(long)]
    min_interval_ms: Option<u64>,

    /// Polling interval in seconds.
    #[clap(short = 'i', long, default_value = "1.0")]
    interval: f64,

    /// CPU busy fraction below which the system counts as idle.
    #[clap(long, default_value = "0.1")]
    idle_util: f64,

    /// procfs mount point.
    #[clap(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// cgroup v2 memory.reclaim file used for soft reclaim.
    #[clap(long, default_value = "/sys/fs/cgroup/memory.reclaim")]
    reclaim_path: PathBuf,

    /// Control file polled for runtime commands.
    #[clap(long)]
    control: Option<PathBuf>,

    /// Statistics report interval in seconds.
    #[clap(long, default_value = "10.0")]
    stats: f64,

    /// Print the effective configuration as JSON and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_config: bool,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

fn nr_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn build_config(opts: &Opts, nr_cpus: usize) -> Result<LmkConfig> {
    let mut config = match &opts.config {
        Some(path) => LmkConfig::from_file(path)?,
        None => LmkConfig {
            soft_reclaim: SoftReclaimConfig::for_cpus(nr_cpus),
            ..Default::default()
        },
    };

    if !opts.adj.is_empty() {
        config.adj = opts.adj.clone();
    }
    if !opts.minfree.is_empty() {
        config.minfree = opts.minfree.clone();
    }
    if let Some(v) = opts.timeout_ms {
        config.timeout_ms = v;
    }
    if let Some(v) = opts.cost {
        config.cost = v;
    }
    if let Some(v) = opts.debug_level {
        config.debug_level = v;
    }
    if opts.enhanced {
        config.victim_slots = MAX_VICTIM_SLOTS;
    } else if let Some(v) = opts.victim_slots {
        config.victim_slots = v;
    }

    let sr = &mut config.soft_reclaim;
    if opts.no_soft_reclaim {
        sr.enabled = false;
    }
    if let Some(v) = opts.nr_reclaim {
        sr.nr_reclaim = v;
    }
    if let Some(v) = opts.min_freeswap {
        sr.min_freeswap = v;
    }
    if let Some(v) = opts.min_reclaim {
        sr.min_reclaim = v;
    }
    if let Some(v) = opts.min_interval_ms {
        sr.min_interval_ms = v;
    }

    config.validate()?;
    Ok(config)
}

fn interval(name: &str, secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        bail!("--{} must be a positive number of seconds, got {}", name, secs);
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Shrinker scan total for `pgscan_delta` pages scanned by kernel reclaim
/// since the last tick, capped at twice the reclaimable estimate.
fn scan_budget(pgscan_delta: u64, cost: i32, max_pass: i64) -> i64 {
    if cost <= 0 || max_pass <= 0 {
        return 0;
    }
    let delta = i64::try_from(pgscan_delta.saturating_mul(4) / cost as u64).unwrap_or(i64::MAX);
    delta.min(max_pass.saturating_mul(2))
}

struct Daemon {
    lmk: LowMemoryKiller,
    proc: Arc<ProcHost>,
    activity: Arc<ProcActivity>,
    control: Option<PathBuf>,
    tick_interval: Duration,
    stats_interval: Duration,
}

impl Daemon {
    fn init(opts: &Opts, config: &LmkConfig) -> Result<Self> {
        let proc = Arc::new(ProcHost::new(&opts.proc_root, opts.priority));
        let activity = Arc::new(ProcActivity::new(proc.clone(), opts.idle_util));
        let host = Host {
            processes: proc.clone(),
            memory: proc.clone(),
            terminator: Arc::new(ProcKiller::new(proc.clone())),
            reclaim: Arc::new(CgroupReclaim::new(&opts.reclaim_path, proc.clone())),
            activity: activity.clone(),
            clock: Arc::new(MonotonicClock::new()),
        };
        let tick_interval = interval("interval", opts.interval)?;
        let stats_interval = interval("stats", opts.stats)?;
        let lmk = LowMemoryKiller::new(config, host)?;

        info!(
            "lmkd: polling {:?} every {:?}, page size {}, priority {:?}",
            proc.root(),
            tick_interval,
            proc.page_size(),
            opts.priority,
        );
        if let Some(path) = &opts.control {
            info!("lmkd: control file {:?}", path);
        }

        Ok(Self {
            lmk,
            proc,
            activity,
            control: opts.control.clone(),
            tick_interval,
            stats_interval,
        })
    }

    /// Drive `on_pressure` the way the kernel drives a shrinker: query the
    /// estimate, then scan in fixed batches while budget remains.
    fn shrink(&self, pgscan_delta: u64) -> usize {
        let max_pass = self.lmk.on_pressure(ShrinkControl::query());
        let mut total = scan_budget(pgscan_delta, self.lmk.cost(), max_pass);
        let mut batches = 0;
        while total >= SHRINK_BATCH {
            let rem = self.lmk.on_pressure(ShrinkControl::scan(SHRINK_BATCH));
            batches += 1;
            if rem <= 0 {
                break;
            }
            total -= SHRINK_BATCH;
        }
        batches
    }

    /// Report victims that have been reaped.
    fn reap_exited(&self) {
        for handle in self.lmk.pending_victims() {
            if !self.proc.is_alive(handle) {
                debug!("victim {} exited", handle);
                self.lmk.on_process_exit(handle);
            }
        }
    }

    fn step(&self) -> Result<()> {
        let sampled = self.activity.sample();

        if let Ok(sample) = &sampled {
            if sample.pgscan_delta > 0 {
                let batches = self.shrink(sample.pgscan_delta);
                debug!(
                    "pgscan_delta={} shrink batches={}",
                    sample.pgscan_delta, batches
                );
            }
        }

        self.reap_exited();

        if let Ok(sample) = &sampled {
            if self.activity.is_idle() {
                let verdict = self.lmk.on_idle(IdleReason::Enter);
                debug!(
                    "idle: busy={:.2} soft reclaim gate {}",
                    sample.cpu_busy, verdict
                );
            }
        }

        if let Some(path) = &self.control {
            control::process_control_file(path, &self.lmk)?;
        }
        sampled.map(|_| ())
    }

    fn report(&self) -> Result<()> {
        let mut buf = Vec::new();
        self.lmk.stats().format(&mut buf)?;
        for line in String::from_utf8_lossy(&buf).lines() {
            info!("{}", line);
        }
        Ok(())
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let now = Instant::now();
        let mut next_tick_at = now;
        let mut next_stats_at = now + self.stats_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= next_tick_at {
                if let Err(e) = self.step() {
                    warn!("tick failed: {:#}", e);
                }
                next_tick_at += self.tick_interval;
                if next_tick_at < now {
                    next_tick_at = now + self.tick_interval;
                }
            }

            if now >= next_stats_at {
                self.report()?;
                next_stats_at += self.stats_interval;
                if next_stats_at < now {
                    next_stats_at = now + self.stats_interval;
                }
            }

            std::thread::sleep(
                next_tick_at
                    .min(next_stats_at)
                    .saturating_duration_since(Instant::now()),
            );
        }

        self.lmk.shutdown();
        self.report()
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let config = build_config(&opts, nr_cpus())?;
    if opts.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    // The killer registers its metric handles on construction, so the
    // recorder goes in first.
    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    } else {
        LogRecorderBuilder::new()
            .with_reporting_interval(interval("stats", opts.stats)?)
            .install(shutdown.clone())?;
    }

    let mut daemon = Daemon::init(&opts, &config)?;
    daemon.run(shutdown)
}
