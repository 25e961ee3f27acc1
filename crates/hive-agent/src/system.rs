#[cfg(target_os = "linux")]
use std::fs;

/// Hostname of this machine, or a random ID if it has none.
pub fn default_slave_id() -> String {
    if let Ok(hostname) = hostname::get()
        && let Some(name) = hostname.to_str()
        && !name.is_empty()
    {
        return name.to_string();
    }
    format!("slave-{}", uuid::Uuid::new_v4().simple())
}

/// Best-effort host resource snapshot.
///
/// On Linux it is read from `/proc`; elsewhere only the core count is known.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemSnapshot {
    pub cpu_cores: u32,
    /// One-minute load average.
    pub load_average: f64,
    /// Load average relative to the core count, as a percentage.
    pub cpu_percent: f64,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_percent: f64,
}

impl SystemSnapshot {
    pub fn capture() -> Self {
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        let mut snap = Self {
            cpu_cores,
            ..Default::default()
        };

        #[cfg(target_os = "linux")]
        {
            if let Ok(content) = fs::read_to_string("/proc/loadavg")
                && let Some(load) = parse_loadavg(&content)
            {
                snap.load_average = load;
            }
            if let Ok(content) = fs::read_to_string("/proc/meminfo")
                && let Some((total, available)) = parse_meminfo(&content)
            {
                snap.memory_total = total;
                snap.memory_used = total.saturating_sub(available);
            }
        }

        snap.cpu_percent = (snap.load_average / f64::from(cpu_cores) * 100.0).clamp(0.0, 100.0);
        if snap.memory_total > 0 {
            snap.memory_percent = snap.memory_used as f64 / snap.memory_total as f64 * 100.0;
        }
        snap
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// `(MemTotal, MemAvailable)` in bytes.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        content.lines().find_map(|line| {
            let rest = line.strip_prefix(name)?.strip_prefix(':')?;
            let kib: u64 = rest.split_whitespace().next()?.parse().ok()?;
            Some(kib * 1024)
        })
    };
    Some((field("MemTotal")?, field("MemAvailable")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_files() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 12345\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);

        let meminfo = "MemTotal:       16384 kB\nMemFree:         1024 kB\nMemAvailable:    4096 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((16384 * 1024, 4096 * 1024)));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn snapshot_is_bounded() {
        let snap = SystemSnapshot::capture();
        assert!(snap.cpu_cores >= 1);
        assert!((0.0..=100.0).contains(&snap.cpu_percent));
        assert!(snap.memory_used <= snap.memory_total);
    }
}
