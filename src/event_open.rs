use std::ffi::CString;
use std::fs;
use std::io::{Error, ErrorKind};

use crate::perf::{
    perf_event_attr, perf_event_open, PerfEventFile, PERF_COUNT_SW_CPU_CLOCK, PERF_COUNT_SW_DUMMY,
    PERF_FLAG_FD_CLOEXEC, PERF_SAMPLE_CPU, PERF_SAMPLE_RAW, PERF_SAMPLE_REGS_USER,
    PERF_SAMPLE_STACK_USER, PERF_SAMPLE_STREAM_ID, PERF_SAMPLE_TID, PERF_SAMPLE_TIME,
    PERF_TYPE_SOFTWARE, PERF_TYPE_TRACEPOINT, SAMPLE_REGS_USER_MASK, SAMPLE_STACK_USER_SIZE,
};

/// Sample fields requested on every fd. Non-SAMPLE records carry them in
/// the sample_id trailer; SAMPLE records lead with them in the same order.
const COMMON_SAMPLE_TYPE: u64 =
    PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU;

fn common_attr() -> Box<perf_event_attr> {
    let mut attr = perf_event_attr::zeroed();
    attr.sample_type = COMMON_SAMPLE_TYPE;
    attr.flags.set_sample_id_all(1);
    attr.flags.set_disabled(1);
    attr
}

/// Open a cpu-wide context-switch event on `cpu`. Emits
/// PERF_RECORD_SWITCH_CPU_WIDE for every switch on that cpu.
pub fn context_switch_event_open(pid: i32, cpu: i32) -> Result<PerfEventFile, Error> {
    let mut attr = common_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.flags.set_context_switch(1);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Open a dummy event delivering PROT_EXEC mmap records and fork/exit
/// task records on `cpu`.
pub fn mmap_task_event_open(pid: i32, cpu: i32) -> Result<PerfEventFile, Error> {
    let mut attr = common_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.flags.set_mmap(1);
    attr.flags.set_task(1);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Open a cpu-clock sampling event on `cpu` firing every `period_ns`,
/// dumping user registers and a user stack snapshot with each sample.
pub fn sample_event_open(period_ns: u64, pid: i32, cpu: i32) -> Result<PerfEventFile, Error> {
    let mut attr = common_attr();
    attr._type = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample.sample_period = period_ns;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_MASK;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE;
    attr.flags.set_exclude_kernel(1);
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Open a uprobe on `binary_path` + `file_offset` on `cpu`. Samples carry
/// user registers and a user stack snapshot, which makes them strictly
/// larger than the empty uretprobe samples.
pub fn uprobe_stack_event_open(
    binary_path: &str,
    file_offset: u64,
    pid: i32,
    cpu: i32,
) -> Result<PerfEventFile, Error> {
    let path = CString::new(binary_path).map_err(|_| Error::from(ErrorKind::InvalidInput))?;
    let mut attr = common_attr();
    attr._type = uprobe_pmu_type()?;
    attr.bp_1.uprobe_path = path.as_ptr() as u64;
    attr.bp_2.probe_offset = file_offset;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_MASK;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Open a uretprobe on `binary_path` + `file_offset` on `cpu`. Emits
/// empty samples: id fields only.
pub fn uretprobe_event_open(
    binary_path: &str,
    file_offset: u64,
    pid: i32,
    cpu: i32,
) -> Result<PerfEventFile, Error> {
    let path = CString::new(binary_path).map_err(|_| Error::from(ErrorKind::InvalidInput))?;
    let mut attr = common_attr();
    attr._type = uprobe_pmu_type()?;
    attr.config = 1 << uprobe_retprobe_bit()?;
    attr.bp_1.uprobe_path = path.as_ptr() as u64;
    attr.bp_2.probe_offset = file_offset;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// Open the tracepoint `category:name` on `cpu`, sampling the raw
/// tracepoint payload with every hit.
pub fn tracepoint_event_open(
    category: &str,
    name: &str,
    pid: i32,
    cpu: i32,
) -> Result<PerfEventFile, Error> {
    let mut attr = common_attr();
    attr._type = PERF_TYPE_TRACEPOINT;
    attr.config = tracepoint_id(category, name)? as u64;
    attr.sample_type |= PERF_SAMPLE_RAW;
    perf_event_open(&attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC)
}

/// The tracefs id of `category:name`, which is also the common_type field
/// of the raw payload of every sample the tracepoint emits.
pub fn tracepoint_id(category: &str, name: &str) -> Result<u32, Error> {
    let candidates = [
        format!("/sys/kernel/tracing/events/{category}/{name}/id"),
        format!("/sys/kernel/debug/tracing/events/{category}/{name}/id"),
    ];
    for path in &candidates {
        if let Ok(content) = fs::read_to_string(path) {
            return parse_sysfs_number(&content).ok_or_else(|| {
                Error::new(ErrorKind::InvalidData, format!("Bad tracepoint id in {path}"))
            });
        }
    }
    Err(Error::new(
        ErrorKind::NotFound,
        format!("No tracefs id for tracepoint {category}:{name}"),
    ))
}

fn uprobe_pmu_type() -> Result<u32, Error> {
    let content = fs::read_to_string("/sys/bus/event_source/devices/uprobe/type")?;
    parse_sysfs_number(&content)
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Bad uprobe PMU type"))
}

fn uprobe_retprobe_bit() -> Result<u32, Error> {
    match fs::read_to_string("/sys/bus/event_source/devices/uprobe/format/retprobe") {
        Ok(content) => parse_retprobe_bit(&content)
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "Bad retprobe format")),
        // Old kernels don't expose the format file; the bit has always
        // been config:0.
        Err(_) => Ok(0),
    }
}

fn parse_sysfs_number(content: &str) -> Option<u32> {
    content.trim().parse().ok()
}

fn parse_retprobe_bit(content: &str) -> Option<u32> {
    // The format file reads "config:0".
    content.trim().strip_prefix("config:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sysfs_formats() {
        assert_eq!(parse_sysfs_number("7\n"), Some(7));
        assert_eq!(parse_sysfs_number("garbage"), None);
        assert_eq!(parse_retprobe_bit("config:0\n"), Some(0));
        assert_eq!(parse_retprobe_bit("retprobe"), None);
    }
}
