//! Command-line configuration for the `local-cluster` binary.

use std::path::PathBuf;

use clap::Parser;

use crate::configuration::{Configuration, LOG_DIR_KEY, WORK_DIR_KEY};

/// Run a simulated cluster in this process until interrupted.
#[derive(Debug, Clone, Parser)]
#[command(name = "local-cluster")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Number of workers to launch.
    #[arg(long, env = "MINICLUSTER_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// CPU share offered by each worker.
    #[arg(long, env = "MINICLUSTER_CPUS", default_value_t = 1.0)]
    pub cpus: f64,

    /// Memory offered by each worker, in MB.
    #[arg(long, env = "MINICLUSTER_MEM", default_value_t = 1024)]
    pub mem: u64,

    /// Disk offered by each worker, in MB.
    #[arg(long, env = "MINICLUSTER_DISK", default_value_t = 10240)]
    pub disk: u64,

    /// Base work directory; worker `i` uses `<work-dir>/<i>`.
    #[arg(long, env = "MINICLUSTER_WORK_DIR")]
    pub work_dir: Option<PathBuf>,

    /// Directory the coordinator publishes at `/coordinator/log`.
    #[arg(long, env = "MINICLUSTER_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Only log warnings and errors.
    #[arg(long, env = "MINICLUSTER_QUIET")]
    pub quiet: bool,
}

impl Config {
    /// Default log filter when `RUST_LOG` is unset.
    pub fn default_filter(&self) -> &'static str {
        if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Translate the flags into the cluster's key/value configuration.
    pub fn to_configuration(&self) -> Configuration {
        let mut configuration =
            Configuration::for_workers(self.workers, self.cpus, self.mem, self.disk, self.quiet);
        if let Some(work_dir) = &self.work_dir {
            configuration.set(WORK_DIR_KEY, work_dir.to_string_lossy().to_string());
        }
        if let Some(log_dir) = &self.log_dir {
            configuration.set(LOG_DIR_KEY, log_dir.to_string_lossy().to_string());
        }
        configuration
    }
}
