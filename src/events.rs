use std::mem;
use std::os::fd::RawFd;

use plain::Plain;

use crate::maps::MapsSnapshot;
use crate::perf::PERF_SAMPLE_REGS_ABI_64;

/// Header of every record in a perf ring buffer: {type, misc flags, size}.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PerfEventHeader {
    pub _type: u32,
    pub misc: u16,
    pub size: u16,
}

/// Trailer appended to non-SAMPLE records when sample_id_all is set. The
/// field order follows the sample_type bits we request on every fd:
/// TID, TIME, STREAM_ID, CPU.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}

/// PERF_RECORD_SWITCH_CPU_WIDE. The switch direction is in the header's
/// misc flags; next_prev identifies the other task of the switch.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchCpuWideRecord {
    pub header: PerfEventHeader,
    pub next_prev_pid: u32,
    pub next_prev_tid: u32,
    pub sample_id: SampleId,
}

/// PERF_RECORD_FORK and PERF_RECORD_EXIT share this layout.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkExitRecord {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleId,
}

/// PERF_RECORD_LOST: `lost` records were dropped on this ring buffer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LostRecord {
    pub header: PerfEventHeader,
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId,
}

/// Fixed-size prefix of PERF_RECORD_MMAP, enough to read the pid without
/// consuming the variable-length record.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapRecordPrefix {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub tid: u32,
}

/// A PERF_RECORD_SAMPLE with no payload beyond the id fields. Uretprobes
/// emit exactly this shape; its size is the authoritative test that tells
/// uretprobe records apart from stack-carrying uprobe records within a
/// uprobe ring buffer.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySampleRecord {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}

unsafe impl Plain for PerfEventHeader {}
unsafe impl Plain for SampleId {}
unsafe impl Plain for SwitchCpuWideRecord {}
unsafe impl Plain for ForkExitRecord {}
unsafe impl Plain for LostRecord {}
unsafe impl Plain for MmapRecordPrefix {}
unsafe impl Plain for EmptySampleRecord {}

pub fn is_empty_sample(header: &PerfEventHeader) -> bool {
    header.size as usize == mem::size_of::<EmptySampleRecord>()
}

impl SwitchCpuWideRecord {
    pub fn is_switch_out(&self) -> bool {
        self.header.misc & crate::perf::PERF_RECORD_MISC_SWITCH_OUT != 0
    }
}

/// User registers captured with a stack sample, in the dump order of
/// SAMPLE_REGS_USER_MASK.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleRegs {
    pub bp: u64,
    pub sp: u64,
    pub ip: u64,
}

/// A decoded stack sample: id fields plus the sampled user registers and
/// the snapshot of user stack bytes starting at sp. `regs` is None when
/// the sample interrupted the kernel and no user register state was dumped.
#[derive(Debug, Default, Clone)]
pub struct StackSample {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub regs: Option<SampleRegs>,
    pub stack: Vec<u8>,
}

/// A decoded raw-tracepoint sample: id fields plus the tracepoint payload.
#[derive(Debug, Default, Clone)]
pub struct RawTracepointSample {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub raw: Vec<u8>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn u32(&mut self) -> Option<u32> {
        let b = self.bytes.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_ne_bytes(b.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        let b = self.bytes.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_ne_bytes(b.try_into().unwrap()))
    }

    fn slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let b = self.bytes.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(b)
    }
}

/// Decode a PERF_RECORD_SAMPLE carrying TID | TIME | STREAM_ID | CPU |
/// REGS_USER | STACK_USER, i.e. the shape emitted by sampling and uprobe
/// fds. `bytes` is the full record, header included. The stack snapshot is
/// truncated to the dynamic size the kernel reports.
pub fn parse_stack_sample(bytes: &[u8]) -> Option<StackSample> {
    let mut c = Cursor::new(bytes);
    c.u64()?; // header

    let pid = c.u32()?;
    let tid = c.u32()?;
    let time = c.u64()?;
    let stream_id = c.u64()?;
    let cpu = c.u32()?;
    c.u32()?; // res

    let abi = c.u64()?;
    let regs = if abi == PERF_SAMPLE_REGS_ABI_64 {
        Some(SampleRegs {
            bp: c.u64()?,
            sp: c.u64()?,
            ip: c.u64()?,
        })
    } else {
        None
    };

    let stack_size = c.u64()? as usize;
    let mut stack = Vec::new();
    if stack_size > 0 {
        let data = c.slice(stack_size)?;
        let dyn_size = c.u64()? as usize;
        stack.extend_from_slice(&data[..dyn_size.min(stack_size)]);
    }

    Some(StackSample {
        pid,
        tid,
        time,
        stream_id,
        cpu,
        regs,
        stack,
    })
}

/// Decode a PERF_RECORD_SAMPLE carrying TID | TIME | STREAM_ID | CPU |
/// RAW, i.e. the shape emitted by tracepoint fds.
pub fn parse_raw_sample(bytes: &[u8]) -> Option<RawTracepointSample> {
    let mut c = Cursor::new(bytes);
    c.u64()?; // header

    let pid = c.u32()?;
    let tid = c.u32()?;
    let time = c.u64()?;
    let stream_id = c.u64()?;
    let cpu = c.u32()?;
    c.u32()?; // res

    let raw_size = c.u32()? as usize;
    let raw = c.slice(raw_size)?.to_vec();

    Some(RawTracepointSample {
        pid,
        tid,
        time,
        stream_id,
        cpu,
        raw,
    })
}

/// A function entry observed through a uprobe. `sp` and `return_address`
/// are the saved return frame captured by the entry sample, used later to
/// stitch sampled callstacks across the uretprobe trampoline.
#[derive(Debug, Clone)]
pub struct UprobeEvent {
    pub tid: u32,
    pub time: u64,
    pub cpu: u32,
    pub function_id: u64,
    pub sp: u64,
    pub return_address: u64,
}

/// A function return observed through a uretprobe.
#[derive(Debug, Clone)]
pub struct UretprobeEvent {
    pub tid: u32,
    pub time: u64,
    pub cpu: u32,
    pub function_id: u64,
}

/// A request to replace the unwinder's memory map snapshot, created when
/// the target mmaps executable memory.
#[derive(Debug, Clone)]
pub struct MapsRefreshEvent {
    pub time: u64,
    pub snapshot: MapsSnapshot,
}

#[derive(Debug, Clone)]
pub enum DeferredPayload {
    UprobeWithStack(UprobeEvent),
    Uretprobe(UretprobeEvent),
    StackSample(StackSample),
    MapsRefresh(MapsRefreshEvent),
}

/// A typed event removed from a ring buffer but not yet processed by the
/// reordering/unwinding pipeline. `origin_fd` identifies the ring buffer it
/// was drained from; events from one origin arrive in timestamp order.
#[derive(Debug, Clone)]
pub struct DeferredEvent {
    pub origin_fd: RawFd,
    pub payload: DeferredPayload,
}

impl DeferredEvent {
    pub fn ts(&self) -> u64 {
        match &self.payload {
            DeferredPayload::UprobeWithStack(e) => e.time,
            DeferredPayload::Uretprobe(e) => e.time,
            DeferredPayload::StackSample(e) => e.time,
            DeferredPayload::MapsRefresh(e) => e.time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layouts_match_the_wire() {
        assert_eq!(mem::size_of::<PerfEventHeader>(), 8);
        assert_eq!(mem::size_of::<SampleId>(), 32);
        assert_eq!(mem::size_of::<SwitchCpuWideRecord>(), 48);
        assert_eq!(mem::size_of::<ForkExitRecord>(), 64);
        assert_eq!(mem::size_of::<LostRecord>(), 56);
        assert_eq!(mem::size_of::<EmptySampleRecord>(), 40);
    }

    #[test]
    fn switch_direction_comes_from_the_misc_flags() {
        let mut record = SwitchCpuWideRecord::default();
        assert!(!record.is_switch_out());
        record.header.misc = crate::perf::PERF_RECORD_MISC_SWITCH_OUT;
        assert!(record.is_switch_out());
    }

    fn push_u64(v: &mut Vec<u8>, x: u64) {
        v.extend_from_slice(&x.to_ne_bytes());
    }

    fn push_u32(v: &mut Vec<u8>, x: u32) {
        v.extend_from_slice(&x.to_ne_bytes());
    }

    fn sample_prefix(pid: u32, tid: u32, time: u64, stream_id: u64, cpu: u32) -> Vec<u8> {
        let mut b = Vec::new();
        push_u64(&mut b, 0); // header
        push_u32(&mut b, pid);
        push_u32(&mut b, tid);
        push_u64(&mut b, time);
        push_u64(&mut b, stream_id);
        push_u32(&mut b, cpu);
        push_u32(&mut b, 0);
        b
    }

    #[test]
    fn parses_stack_sample_with_regs() {
        let mut b = sample_prefix(10, 11, 1234, 7, 2);
        push_u64(&mut b, PERF_SAMPLE_REGS_ABI_64);
        push_u64(&mut b, 0x100); // bp
        push_u64(&mut b, 0x200); // sp
        push_u64(&mut b, 0x300); // ip
        push_u64(&mut b, 16); // stack size
        push_u64(&mut b, 0xdead);
        push_u64(&mut b, 0xbeef);
        push_u64(&mut b, 8); // dyn size

        let sample = parse_stack_sample(&b).unwrap();
        assert_eq!(sample.tid, 11);
        assert_eq!(sample.time, 1234);
        assert_eq!(sample.stream_id, 7);
        assert_eq!(
            sample.regs,
            Some(SampleRegs {
                bp: 0x100,
                sp: 0x200,
                ip: 0x300
            })
        );
        assert_eq!(sample.stack, 0xdeadu64.to_ne_bytes());
    }

    #[test]
    fn parses_stack_sample_without_user_regs() {
        let mut b = sample_prefix(10, 11, 99, 7, 0);
        push_u64(&mut b, 0); // abi none, no regs follow
        push_u64(&mut b, 0); // empty stack, no dyn size follows

        let sample = parse_stack_sample(&b).unwrap();
        assert_eq!(sample.regs, None);
        assert!(sample.stack.is_empty());
    }

    #[test]
    fn parses_raw_sample() {
        let mut b = sample_prefix(1, 2, 3, 4, 5);
        push_u32(&mut b, 8);
        push_u64(&mut b, 0xabcd);

        let sample = parse_raw_sample(&b).unwrap();
        assert_eq!(sample.raw, 0xabcdu64.to_ne_bytes());
    }

    #[test]
    fn truncated_sample_is_rejected() {
        let b = sample_prefix(1, 2, 3, 4, 5);
        let truncated = &b[..b.len() - 4];
        assert!(parse_stack_sample(truncated).is_none());
    }
}
