use std::fs;

use anyhow::{Context, Result};
use regex::Regex;

/// One mapped region of the target's address space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapRegion {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: String,
    pub executable: bool,
}

/// A frozen view of `/proc/<pid>/maps`, ordered by start address. The
/// unwinder resolves sampled instruction pointers against this.
#[derive(Debug, Default, Clone)]
pub struct MapsSnapshot {
    regions: Vec<MapRegion>,
}

impl MapsSnapshot {
    /// Capture the current maps of `pid`.
    pub fn read(pid: u32) -> Result<Self> {
        let content = fs::read_to_string(format!("/proc/{pid}/maps"))
            .with_context(|| format!("Failed to read maps of pid {pid}"))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut regions = Vec::new();
        for line in content.lines() {
            let mut fields = line.split_whitespace();
            let (Some(range), Some(perms), Some(offset)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end), Ok(file_offset)) = (
                u64::from_str_radix(start, 16),
                u64::from_str_radix(end, 16),
                u64::from_str_radix(offset, 16),
            ) else {
                continue;
            };
            // dev and inode
            fields.next();
            fields.next();
            let path = fields.next().unwrap_or("").to_string();
            regions.push(MapRegion {
                start,
                end,
                file_offset,
                path,
                executable: perms.contains('x'),
            });
        }
        regions.sort_by_key(|r| r.start);
        MapsSnapshot { regions }
    }

    /// The region containing `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<&MapRegion> {
        let idx = self.regions.partition_point(|r| r.start <= addr);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        (addr < region.end).then_some(region)
    }

    pub fn regions(&self) -> &[MapRegion] {
        &self.regions
    }
}

/// The tids currently live in the target process.
pub fn list_threads(pid: u32) -> Result<Vec<u32>> {
    let mut tids = Vec::new();
    let entries = fs::read_dir(format!("/proc/{pid}/task"))
        .with_context(|| format!("Failed to list threads of pid {pid}"))?;
    for entry in entries {
        let entry = entry?;
        if let Ok(tid) = entry.file_name().to_string_lossy().parse::<u32>() {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

/// Number of cpus in the system, as perf_event_open counts them.
pub fn num_cpus() -> i32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as i32
    }
}

/// Parse a kernel cpu list such as "0-3,5,8-9".
pub fn parse_cpu_list(list: &str) -> Vec<i32> {
    let re = Regex::new(r"(\d+)(?:-(\d+))?").unwrap();
    let mut cpus = Vec::new();
    for cap in re.captures_iter(list) {
        let start: i32 = cap[1].parse().unwrap();
        let end: i32 = match cap.get(2) {
            Some(m) => m.as_str().parse().unwrap(),
            None => start,
        };
        for cpu in start..=end {
            cpus.push(cpu);
        }
    }
    cpus
}

/// The cpus in the target's cgroup cpuset: the only cpus the process can be
/// scheduled on. Empty when the cpuset cannot be resolved; callers fall
/// back to all cpus.
pub fn cpuset_cpus(pid: u32) -> Vec<i32> {
    let Ok(cpuset) = fs::read_to_string(format!("/proc/{pid}/cpuset")) else {
        return Vec::new();
    };
    let cpuset = cpuset.trim();

    // cgroup v1 mounts the cpuset controller separately; v2 keeps the
    // effective list in the unified hierarchy.
    let candidates = [
        format!("/sys/fs/cgroup/cpuset{cpuset}/cpuset.cpus"),
        format!("/sys/fs/cgroup{cpuset}/cpuset.cpus.effective"),
    ];
    for path in candidates {
        if let Ok(list) = fs::read_to_string(&path) {
            let cpus = parse_cpu_list(list.trim());
            if !cpus.is_empty() {
                return cpus;
            }
        }
    }
    Vec::new()
}

/// CLOCK_MONOTONIC in nanoseconds, the clock perf records are stamped with.
pub fn monotonic_timestamp_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55f0aa000000-55f0aa010000 r-xp 00001000 fd:01 123 /usr/bin/target
55f0aa010000-55f0aa020000 rw-p 00000000 00:00 0 [heap]
7ffd10000000-7ffd10021000 rw-p 00000000 00:00 0 [stack]
";

    #[test]
    fn parses_and_finds_regions() {
        let maps = MapsSnapshot::parse(MAPS);
        assert_eq!(maps.regions().len(), 3);

        let text = maps.find(0x55f0aa000abc).unwrap();
        assert_eq!(text.path, "/usr/bin/target");
        assert!(text.executable);
        assert_eq!(text.file_offset, 0x1000);

        let heap = maps.find(0x55f0aa010000).unwrap();
        assert!(!heap.executable);

        assert!(maps.find(0x1000).is_none());
        assert!(maps.find(0x7ffd10021000).is_none());
    }

    #[test]
    fn parses_cpu_lists() {
        assert_eq!(parse_cpu_list("0-3,5"), vec![0, 1, 2, 3, 5]);
        assert_eq!(parse_cpu_list("7"), vec![7]);
        assert_eq!(parse_cpu_list(""), Vec::<i32>::new());
    }
}
