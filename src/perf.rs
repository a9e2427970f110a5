use std::io::Error;
use std::mem;
use std::os::fd::{AsRawFd, RawFd};

use bitfield::bitfield;
use libc;
use nix::errno::Errno;
use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, request_code_none};

#[repr(C)]
pub union sample_un {
    pub sample_period: u64,
    pub sample_freq: u64,
}

#[repr(C)]
pub union wakeup_un {
    pub wakeup_events: u32,
    pub wakeup_watermark: u32,
}

#[repr(C)]
pub union bp_1_un {
    pub bp_addr: u64,
    pub kprobe_func: u64,
    pub uprobe_path: u64,
    pub config1: u64,
}

#[repr(C)]
pub union bp_2_un {
    pub bp_len: u64,
    pub kprobe_addr: u64,
    pub probe_offset: u64,
    pub config2: u64,
}

bitfield! {
    #[allow(non_camel_case_types)]
    pub struct perf_event_attr_flags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 15, 16;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub write_backward, set_write_backward: 27, 27;
    pub namespaces, set_namespaces: 28, 28;
    pub ksymbol, set_ksymbol: 29, 29;
    pub bpf_event, set_bpf_event: 30, 30;
    pub aux_output, set_aux_output: 31, 31;
    pub cgroup, set_cgroup: 32, 32;
    pub text_poke, set_text_poke: 33, 33;
    pub build_id, set_build_id: 34, 34;
    pub inherit_thread, set_inherit_thread: 35, 35;
    pub remove_on_exec, set_remove_on_exec: 36, 36;
    pub sigtrap, set_sigtrap: 37, 37;
    pub __reserved_1, _: 38, 63;
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct perf_event_attr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample: sample_un,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: perf_event_attr_flags,
    pub wakeup: wakeup_un,
    pub bp_type: u32,
    pub bp_1: bp_1_un,
    pub bp_2: bp_2_un,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
    pub aux_sample_size: u32,
    pub __reserved_3: u32,
}

impl perf_event_attr {
    /// Zero-initialized attr with the size field already filled in.
    pub fn zeroed() -> Box<Self> {
        let mut attr: Box<perf_event_attr> = unsafe { Box::new(mem::zeroed()) };
        attr.size = mem::size_of::<perf_event_attr>() as u32;
        attr
    }
}

pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_COUNT_SW_CPU_CLOCK: u64 = 0;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

// perf_event_sample_format, the bits of perf_event_attr::sample_type.
pub const PERF_SAMPLE_TID: u64 = 1 << 1;
pub const PERF_SAMPLE_TIME: u64 = 1 << 2;
pub const PERF_SAMPLE_CPU: u64 = 1 << 7;
pub const PERF_SAMPLE_STREAM_ID: u64 = 1 << 9;
pub const PERF_SAMPLE_RAW: u64 = 1 << 10;
pub const PERF_SAMPLE_REGS_USER: u64 = 1 << 12;
pub const PERF_SAMPLE_STACK_USER: u64 = 1 << 13;

// perf_event_type, the values of perf_event_header::type.
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;
pub const PERF_RECORD_SWITCH: u32 = 14;
pub const PERF_RECORD_SWITCH_CPU_WIDE: u32 = 15;

// perf_event_header::misc bits.
pub const PERF_RECORD_MISC_SWITCH_OUT: u16 = 1 << 13;

// perf_regs_x86 indices, used to build the sample_regs_user mask and to
// know the dump order of the sampled registers.
pub const PERF_REG_X86_BP: u64 = 6;
pub const PERF_REG_X86_SP: u64 = 7;
pub const PERF_REG_X86_IP: u64 = 8;

pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

/// Registers requested for stack samples: bp, sp and ip, which is what the
/// frame-pointer unwinder consumes. The kernel dumps them in index order.
pub const SAMPLE_REGS_USER_MASK: u64 =
    (1 << PERF_REG_X86_BP) | (1 << PERF_REG_X86_SP) | (1 << PERF_REG_X86_IP);

/// Bytes of user stack copied into each stack sample. Must be a multiple
/// of 8 and fit the u16 record size field, hence the largest usable value.
pub const SAMPLE_STACK_USER_SIZE: u32 = 65528;

pub const PERF_FLAG_FD_CLOEXEC: libc::c_ulong = 1 << 3;

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

pub fn perf_event_open(
    attr: &perf_event_attr,
    pid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<PerfEventFile, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            pid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;

    if fd < 0 {
        return Err(Error::last_os_error());
    }

    Ok(PerfEventFile { fd })
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_SET_OUTPUT: u8 = 5;
const PERF_EVENT_IOC_ID: u8 = 7;
ioctl_none!(
    perf_event_ioc_enable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_ENABLE
);
ioctl_none!(
    perf_event_ioc_disable,
    PERF_EVENT_MAGIC,
    PERF_EVENT_IOC_DISABLE
);
ioctl_write_int_bad!(
    perf_event_ioc_set_output,
    request_code_none!(PERF_EVENT_MAGIC, PERF_EVENT_IOC_SET_OUTPUT)
);
ioctl_read!(perf_event_ioc_id, PERF_EVENT_MAGIC, PERF_EVENT_IOC_ID, u64);

/// An open perf event. Owns the file descriptor and closes it on drop, so
/// dropping the tracer's fd list is the close phase.
#[derive(Debug)]
pub struct PerfEventFile {
    fd: RawFd,
}

impl PerfEventFile {
    pub fn enable(&self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_enable(self.fd) } {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn disable(&self) -> Result<(), Error> {
        match unsafe { perf_event_ioc_disable(self.fd) } {
            Ok(_) => Ok(()),
            Err(e) => {
                if e == Errno::ENOTTY {
                    return Ok(());
                }
                Err(e.into())
            }
        }
    }

    /// Redirect this event's output into the ring buffer owned by
    /// `ring_buffer_fd`. The ring buffer must already be mmap'd.
    pub fn redirect_to(&self, ring_buffer_fd: RawFd) -> Result<(), Error> {
        match unsafe { perf_event_ioc_set_output(self.fd, ring_buffer_fd) } {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The kernel-assigned stream id of this event, carried in the
    /// PERF_SAMPLE_STREAM_ID field of every sample it emits.
    pub fn stream_id(&self) -> Result<u64, Error> {
        let mut id: u64 = 0;
        match unsafe { perf_event_ioc_id(self.fd, &mut id) } {
            Ok(_) => Ok(id),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for PerfEventFile {
    fn as_raw_fd(&self) -> i32 {
        self.fd
    }
}

impl Drop for PerfEventFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
