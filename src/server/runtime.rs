//! Sizing of the tokio runtime.
//!
//! With `--workers 1` the gateway runs a current-thread runtime: one
//! cooperative event loop interleaving every request. Otherwise worker
//! threads default to the container CPU limit rather than the host count.

/// Where the worker count came from, for the startup log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuSource {
    Flag,
    Env,
    CgroupV2,
    CgroupV1,
    Host,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPlan {
    pub threads: usize,
    pub source: CpuSource,
}

impl WorkerPlan {
    pub fn current_thread(&self) -> bool {
        self.threads == 1
    }
}

/// Resolve the worker count: explicit flag, then `EDGE_CPU_LIMIT` ("4" or
/// "4000m"), then cgroup v2 `cpu.max`, then cgroup v1 quota/period, then the
/// host CPU count.
pub fn plan_workers(flag: Option<usize>) -> WorkerPlan {
    let plan = |threads: usize, source| WorkerPlan {
        threads: threads.max(1),
        source,
    };

    if let Some(n) = flag {
        return plan(n, CpuSource::Flag);
    }
    if let Some(cores) = std::env::var("EDGE_CPU_LIMIT")
        .ok()
        .and_then(|v| parse_cpu_value(&v))
    {
        return plan(cores, CpuSource::Env);
    }
    if let Some(cores) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|v| parse_cgroup_v2_cpu(&v))
    {
        return plan(cores, CpuSource::CgroupV2);
    }
    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        if let Some(cores) = parse_cgroup_v1_cpu(&quota, &period) {
            return plan(cores, CpuSource::CgroupV1);
        }
    }
    let host = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    plan(host, CpuSource::Host)
}

/// Build the runtime described by `plan`.
pub fn build(plan: &WorkerPlan) -> std::io::Result<tokio::runtime::Runtime> {
    if plan.current_thread() {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(plan.threads)
            .enable_all()
            .build()
    }
}

fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(milli) => milli.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// `cpu.max` holds "quota period" or "max period".
fn parse_cgroup_v2_cpu(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

fn parse_cgroup_v1_cpu(quota: &str, period: &str) -> Option<usize> {
    let quota: i64 = quota.trim().parse().ok()?;
    let period: i64 = period.trim().parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_wins() {
        let plan = plan_workers(Some(1));
        assert_eq!(plan.source, CpuSource::Flag);
        assert!(plan.current_thread());

        let plan = plan_workers(Some(0));
        assert_eq!(plan.threads, 1);
    }

    #[test]
    fn test_fallback_is_positive() {
        assert!(plan_workers(None).threads >= 1);
    }

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value("  8  "), Some(8));
        assert_eq!(parse_cpu_value("2000m"), Some(2));
        assert_eq!(parse_cpu_value("500m"), Some(0));
        assert_eq!(parse_cpu_value("lots"), None);
    }

    #[test]
    fn test_parse_cgroup() {
        assert_eq!(parse_cgroup_v2_cpu("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_v2_cpu("max 100000"), None);
        assert_eq!(parse_cgroup_v2_cpu(""), None);
        assert_eq!(parse_cgroup_v1_cpu("200000", "100000"), Some(2));
        assert_eq!(parse_cgroup_v1_cpu("-1", "100000"), None);
    }

    #[test]
    fn test_current_thread_runtime() {
        let rt = build(&WorkerPlan {
            threads: 1,
            source: CpuSource::Flag,
        })
        .unwrap();
        assert_eq!(rt.block_on(async { 2 + 2 }), 4);
    }
}
