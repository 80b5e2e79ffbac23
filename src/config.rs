//! Runtime tunables.
//!
//! Defaults come from the platform page size and conservative constants;
//! each knob can be overridden through an `NXFLATE_*` environment variable.
//! The environment is read once per process; streams copy the configuration
//! at construction so individual streams can also be tuned explicitly.

use once_cell::sync::Lazy;

use crate::INF_HIS_LEN;

/// Tuning knobs for an inflate stream.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    /// Page size used for buffer alignment and fault-in granularity.
    pub page_sz: usize,
    /// Caller inputs smaller than this are concatenated in the input fifo
    /// before a job is built, amortizing per-job overhead.
    pub soft_copy_threshold: usize,
    /// Upper bound on the new (non-history) source bytes advertised to a
    /// single job.
    pub per_job_len: usize,
    /// Page-fault resubmission budget per job.
    pub retry_max: u32,
    /// DEFLATE window the device maintains across jobs, in bytes.
    pub window_max: usize,
    /// Cap on the gzip EXTRA field surfaced to the caller.
    pub extra_max: usize,
    /// Cap on the gzip NAME field surfaced to the caller.
    pub name_max: usize,
    /// Cap on the gzip COMMENT field surfaced to the caller.
    pub comm_max: usize,
}

impl Default for Config {
    fn default() -> Config {
        *global()
    }
}

impl Config {
    fn base() -> Config {
        Config {
            page_sz: page_size(),
            soft_copy_threshold: 1024,
            per_job_len: 1 << 20,
            retry_max: 50,
            window_max: INF_HIS_LEN,
            extra_max: 4096,
            name_max: 256,
            comm_max: 256,
        }
    }

    /// Reads the configuration from the environment.
    pub fn from_env() -> Config {
        let mut cfg = Config::base();
        if let Some(v) = env_usize("NXFLATE_PAGE_SZ") {
            cfg.page_sz = v.max(1);
        }
        if let Some(v) = env_usize("NXFLATE_SOFT_COPY_THRESHOLD") {
            cfg.soft_copy_threshold = v.max(1);
        }
        if let Some(v) = env_usize("NXFLATE_PER_JOB_LEN") {
            cfg.per_job_len = v.max(1);
        }
        if let Some(v) = env_usize("NXFLATE_RETRY_MAX") {
            cfg.retry_max = v as u32;
        }
        if let Some(v) = env_usize("NXFLATE_NAME_MAX") {
            cfg.name_max = v.max(2);
            cfg.comm_max = v.max(2);
        }
        cfg
    }
}

static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

/// The process-wide configuration, read from the environment once.
pub(crate) fn global() -> &'static Config {
    &CONFIG
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparsable {name}={raw}");
            None
        }
    }
}

fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}
