//! The tracer engine: owns the perf fds and ring buffers, runs the
//! open/enable/poll/disable/close lifecycle, classifies records and
//! dispatches them to the listener or to the deferred-events pipeline.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, warn};

use crate::event_open::{
    context_switch_event_open, mmap_task_event_open, sample_event_open, tracepoint_event_open,
    tracepoint_id, uprobe_stack_event_open, uretprobe_event_open,
};
use crate::events::{
    is_empty_sample, parse_raw_sample, parse_stack_sample, DeferredEvent, DeferredPayload,
    EmptySampleRecord, ForkExitRecord, LostRecord, MapsRefreshEvent, MmapRecordPrefix,
    PerfEventHeader, SwitchCpuWideRecord, UprobeEvent, UretprobeEvent,
};
use crate::gpu::GpuTracepointProcessor;
use crate::listener::TracerListener;
use crate::maps::{self, MapsSnapshot};
use crate::perf::PerfEventFile;
use crate::perf::{
    PERF_RECORD_EXIT, PERF_RECORD_FORK, PERF_RECORD_LOST, PERF_RECORD_MMAP, PERF_RECORD_SAMPLE,
    PERF_RECORD_SWITCH, PERF_RECORD_SWITCH_CPU_WIDE,
};
use crate::reorder::EventReorderer;
use crate::ringbuf::PerfEventRingBuffer;
use crate::stats::TracerStats;
use crate::unwinding::{FramePointerUnwinder, UprobesUnwindingVisitor};

const CONTEXT_SWITCHES_RING_BUFFER_SIZE_KB: u32 = 256;
const MMAP_TASK_RING_BUFFER_SIZE_KB: u32 = 64;
const SAMPLING_RING_BUFFER_SIZE_KB: u32 = 8192;
const UPROBES_RING_BUFFER_SIZE_KB: u32 = 8192;
const GPU_TRACING_RING_BUFFER_SIZE_KB: u32 = 256;

/// Records drained from one ring buffer before moving to the next, so no
/// buffer starves the others.
const ROUND_ROBIN_POLLING_BATCH_SIZE: u32 = 5;

/// Sleep when a full poll pass produced nothing. Short enough that ring
/// buffers don't overflow at peak rates.
const IDLE_TIME_ON_EMPTY_RING_BUFFERS_MS: u64 = 2;
const IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS_MS: u64 = 10;

const GPU_TRACEPOINTS: [(&str, &str); 3] = [
    ("amdgpu", "amdgpu_cs_ioctl"),
    ("amdgpu", "amdgpu_sched_run_job"),
    ("dma_fence", "dma_fence_signaled"),
];

/// A function to instrument with a uprobe/uretprobe pair. `id` is the
/// identity reported in `on_function_call`; the probes attach at
/// `binary_path` + `file_offset`.
#[derive(Debug, Clone)]
pub struct InstrumentedFunction {
    pub id: u64,
    pub binary_path: String,
    pub file_offset: u64,
    pub virtual_address: u64,
}

/// Tracer configuration. Immutable once the tracer is constructed.
#[derive(Debug, Clone)]
pub struct TracerConfig {
    /// Pid of the process to trace.
    pub pid: u32,
    /// Stack sampling period in nanoseconds.
    pub sampling_period_ns: u64,
    /// Record cpu-wide context switches.
    pub trace_context_switches: bool,
    /// Sample and unwind callstacks.
    pub trace_callstacks: bool,
    /// Attach u(ret)probes to `instrumented_functions`.
    pub trace_instrumented_functions: bool,
    /// Record GPU driver tracepoint events, system-wide.
    pub trace_gpu_driver_events: bool,
    /// Functions to instrument.
    pub instrumented_functions: Vec<InstrumentedFunction>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            pid: 0,
            sampling_period_ns: 1_000_000,
            trace_context_switches: true,
            trace_callstacks: true,
            trace_instrumented_functions: true,
            trace_gpu_driver_events: false,
            instrumented_functions: Vec::new(),
        }
    }
}

/// The whole-process tracer.
///
/// `run` drives the poll loop on the calling thread until the exit flag is
/// set, with a second thread reordering and unwinding deferred events.
/// All fds and ring buffers are owned here: they are created in the open
/// phase and released when the run finishes.
pub struct Tracer {
    config: TracerConfig,
    listener: Arc<dyn TracerListener>,
    tracing_fds: Vec<PerfEventFile>,
    ring_buffers: Vec<PerfEventRingBuffer>,
    uprobes_fds: HashSet<RawFd>,
    gpu_tracing_fds: HashSet<RawFd>,
    uprobes_ids_to_function: HashMap<u64, u64>,
    deferred_events: Arc<Mutex<Vec<DeferredEvent>>>,
    stop_deferred_thread: Arc<AtomicBool>,
    gpu_event_processor: Option<GpuTracepointProcessor>,
    stats: TracerStats,
}

impl Tracer {
    pub fn new(config: TracerConfig, listener: Arc<dyn TracerListener>) -> Self {
        Tracer {
            config,
            listener,
            tracing_fds: Vec::new(),
            ring_buffers: Vec::new(),
            uprobes_fds: HashSet::new(),
            gpu_tracing_fds: HashSet::new(),
            uprobes_ids_to_function: HashMap::new(),
            deferred_events: Arc::new(Mutex::new(Vec::new())),
            stop_deferred_thread: Arc::new(AtomicBool::new(false)),
            gpu_event_processor: None,
            stats: TracerStats::default(),
        }
    }

    /// Trace until `exit_requested` becomes true, then drain and release
    /// everything. The tracer can be run again afterwards.
    pub fn run(&mut self, exit_requested: Arc<AtomicBool>) -> Result<()> {
        self.reset();

        let all_cpus: Vec<i32> = (0..maps::num_cpus()).collect();
        let mut cpuset_cpus = maps::cpuset_cpus(self.config.pid);
        if cpuset_cpus.is_empty() {
            error!("Could not read cpuset of pid {}", self.config.pid);
            cpuset_cpus = all_cpus.clone();
        }

        let mut perf_event_open_errors = false;
        let mut uprobes_event_open_errors = false;

        if self.config.trace_context_switches {
            self.open_context_switches(&all_cpus, &mut perf_event_open_errors);
        }

        let initial_maps = MapsSnapshot::read(self.config.pid).unwrap_or_else(|e| {
            warn!("{e:#}");
            MapsSnapshot::default()
        });
        let visitor = UprobesUnwindingVisitor::new(
            initial_maps,
            FramePointerUnwinder,
            self.listener.clone(),
        );
        let reorderer = EventReorderer::new();

        if self.config.trace_gpu_driver_events && !self.open_gpu_tracepoints(&all_cpus) {
            error!("There were errors opening GPU tracepoint events");
        }

        if self.config.trace_instrumented_functions {
            self.open_uprobes(
                &cpuset_cpus,
                &mut perf_event_open_errors,
                &mut uprobes_event_open_errors,
            );
        }

        self.open_mmap_task(&cpuset_cpus, &mut perf_event_open_errors);

        if self.config.trace_callstacks {
            self.open_sampling(&cpuset_cpus, &mut perf_event_open_errors);
        }

        if uprobes_event_open_errors {
            warn!(
                "There were errors with perf_event_open, including for uprobes: \
                 did you forget to run as root?"
            );
        } else if perf_event_open_errors {
            warn!(
                "There were errors with perf_event_open: did you forget to run as root \
                 or to set /proc/sys/kernel/perf_event_paranoid to -1?"
            );
        }

        // Start recording.
        for fd in &self.tracing_fds {
            if let Err(e) = fd.enable() {
                warn!("Failed to enable perf event: {e}");
            }
        }

        for tid in maps::list_threads(self.config.pid).unwrap_or_default() {
            self.listener.on_tid(tid);
        }

        self.stats.reset(maps::monotonic_timestamp_ns());

        let deferred_events = self.deferred_events.clone();
        let stop = self.stop_deferred_thread.clone();
        let deferred_events_thread = thread::Builder::new()
            .name("deferred_events".to_string())
            .spawn(move || process_deferred_events(reorderer, visitor, deferred_events, stop))
            .context("Failed to spawn the deferred events thread")?;

        self.poll_loop(&exit_requested);

        // Finish processing all deferred events.
        self.stop_deferred_thread.store(true, Ordering::Release);
        let (mut reorderer, mut visitor) = deferred_events_thread
            .join()
            .map_err(|_| anyhow!("The deferred events thread panicked"))?;
        reorderer.process_all_events(&mut visitor);

        // Stop recording, unmap the ring buffers, close the fds.
        for fd in &self.tracing_fds {
            if let Err(e) = fd.disable() {
                warn!("Failed to disable perf event: {e}");
            }
        }
        self.ring_buffers.clear();
        self.tracing_fds.clear();

        Ok(())
    }

    fn reset(&mut self) {
        self.tracing_fds.clear();
        self.ring_buffers.clear();
        self.uprobes_fds.clear();
        self.gpu_tracing_fds.clear();
        self.uprobes_ids_to_function.clear();
        self.deferred_events.lock().unwrap().clear();
        self.stop_deferred_thread.store(false, Ordering::Release);
        self.gpu_event_processor = None;
        self.stats = TracerStats::default();
    }

    fn poll_loop(&mut self, exit_requested: &AtomicBool) {
        // Take the buffer list so record processing can borrow the tracer
        // mutably alongside the buffer being drained.
        let mut ring_buffers = mem::take(&mut self.ring_buffers);
        let mut last_iteration_saw_events = false;

        while !exit_requested.load(Ordering::Relaxed) {
            if !last_iteration_saw_events {
                self.stats
                    .log_if_window_elapsed(maps::monotonic_timestamp_ns());
                thread::sleep(Duration::from_millis(IDLE_TIME_ON_EMPTY_RING_BUFFERS_MS));
            }
            last_iteration_saw_events = false;

            // Round-robin over the ring buffers: up to a fixed batch of
            // records from each before moving on.
            for ring_buffer in ring_buffers.iter_mut() {
                if exit_requested.load(Ordering::Relaxed) {
                    break;
                }
                for _ in 0..ROUND_ROBIN_POLLING_BATCH_SIZE {
                    if exit_requested.load(Ordering::Relaxed) {
                        break;
                    }
                    if !ring_buffer.has_new_data() {
                        break;
                    }
                    last_iteration_saw_events = true;
                    let header = ring_buffer.read_header();
                    self.process_record(&header, ring_buffer);
                }
            }
        }

        self.ring_buffers = ring_buffers;
    }

    fn process_record(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        match header._type {
            PERF_RECORD_SWITCH => {
                // Context switches are recorded cpu-wide, so per-thread
                // switch records are never set up.
                error!(
                    "Unexpected PERF_RECORD_SWITCH (only PERF_RECORD_SWITCH_CPU_WIDE \
                     are expected)"
                );
                ring_buffer.skip_record(header);
            }
            PERF_RECORD_SWITCH_CPU_WIDE => {
                self.process_context_switch_cpu_wide(header, ring_buffer)
            }
            PERF_RECORD_FORK => self.process_fork(header, ring_buffer),
            PERF_RECORD_EXIT => self.process_exit(header, ring_buffer),
            PERF_RECORD_MMAP => self.process_mmap(header, ring_buffer),
            PERF_RECORD_SAMPLE => self.process_sample(header, ring_buffer),
            PERF_RECORD_LOST => self.process_lost(header, ring_buffer),
            _ => {
                error!("Unexpected perf_event_header type: {}", header._type);
                ring_buffer.skip_record(header);
            }
        }
    }

    fn process_context_switch_cpu_wide(
        &mut self,
        header: &PerfEventHeader,
        ring_buffer: &mut PerfEventRingBuffer,
    ) {
        let mut record = SwitchCpuWideRecord::default();
        ring_buffer.consume_record(header, &mut record);
        let id = &record.sample_id;

        // Switches with tid 0 are the idle task, discard them.
        if id.tid != 0 {
            if record.is_switch_out() {
                self.listener
                    .on_context_switch_out(id.tid, id.cpu, id.time);
            } else {
                self.listener.on_context_switch_in(id.tid, id.cpu, id.time);
            }
        }

        self.stats.sched_switch_count += 1;
    }

    fn process_fork(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        let mut record = ForkExitRecord::default();
        ring_buffer.consume_record(header, &mut record);

        // A new thread of the traced process was spawned.
        if record.pid == self.config.pid {
            self.listener.on_tid(record.tid);
        }
    }

    fn process_exit(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        let mut record = ForkExitRecord::default();
        ring_buffer.consume_record(header, &mut record);

        if record.pid != self.config.pid {
            return;
        }

        // A thread of the traced process exited; no bookkeeping needed.
    }

    fn process_mmap(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        let prefix: MmapRecordPrefix = ring_buffer.read_value_at(0);
        ring_buffer.skip_record(header);

        if prefix.pid != self.config.pid {
            return;
        }

        // The target mapped executable memory, so refresh the maps used
        // for unwinding. This should happen rarely.
        match MapsSnapshot::read(self.config.pid) {
            Ok(snapshot) => self.defer_event(DeferredEvent {
                origin_fd: ring_buffer.file_descriptor(),
                payload: DeferredPayload::MapsRefresh(MapsRefreshEvent {
                    time: maps::monotonic_timestamp_ns(),
                    snapshot,
                }),
            }),
            Err(e) => warn!("{e:#}"),
        }
    }

    fn process_sample(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        let fd = ring_buffer.file_descriptor();
        let is_probe = self.uprobes_fds.contains(&fd);
        let is_gpu_event = self.gpu_tracing_fds.contains(&fd);

        // An event can never be both a probe and a GPU event.
        assert!(
            !(is_probe && is_gpu_event),
            "fd {fd} registered as both uprobe and gpu tracepoint"
        );

        let is_uretprobe = is_probe && is_empty_sample(header);
        let is_uprobe = is_probe && !is_uretprobe;

        // The id fields lead every sample shape, so the pid can be peeked
        // uniformly. Samples of other processes are skipped, except GPU
        // tracepoints which are wanted system-wide.
        let prefix: EmptySampleRecord = ring_buffer.read_value_at(0);
        if prefix.pid != self.config.pid && !is_gpu_event {
            ring_buffer.skip_record(header);
            return;
        }

        if is_uprobe {
            let bytes = ring_buffer.consume_raw(header);
            if let Some(sample) = parse_stack_sample(&bytes) {
                let function_id = self.function_for_stream(sample.stream_id);
                if let Some(regs) = sample.regs {
                    // At function entry the return address is on top of
                    // the stack, which is where the snapshot starts.
                    let return_address = sample
                        .stack
                        .get(..8)
                        .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(0);
                    self.defer_event(DeferredEvent {
                        origin_fd: fd,
                        payload: DeferredPayload::UprobeWithStack(UprobeEvent {
                            tid: sample.tid,
                            time: sample.time,
                            cpu: sample.cpu,
                            function_id,
                            sp: regs.sp,
                            return_address,
                        }),
                    });
                } else {
                    debug!("Uprobe sample without user registers");
                }
            }
            self.stats.uprobes_count += 1;
        } else if is_uretprobe {
            let mut record = EmptySampleRecord::default();
            ring_buffer.consume_record(header, &mut record);
            let function_id = self.function_for_stream(record.stream_id);
            self.defer_event(DeferredEvent {
                origin_fd: fd,
                payload: DeferredPayload::Uretprobe(UretprobeEvent {
                    tid: record.tid,
                    time: record.time,
                    cpu: record.cpu,
                    function_id,
                }),
            });
            self.stats.uprobes_count += 1;
        } else if is_gpu_event {
            let bytes = ring_buffer.consume_raw(header);
            if let Some(sample) = parse_raw_sample(&bytes) {
                if let Some(processor) = self.gpu_event_processor.as_mut() {
                    processor.push_event(&sample);
                }
            }
            self.stats.gpu_events_count += 1;
        } else {
            let bytes = ring_buffer.consume_raw(header);
            if let Some(sample) = parse_stack_sample(&bytes) {
                self.defer_event(DeferredEvent {
                    origin_fd: fd,
                    payload: DeferredPayload::StackSample(sample),
                });
            }
            self.stats.sample_count += 1;
        }
    }

    fn process_lost(&mut self, header: &PerfEventHeader, ring_buffer: &mut PerfEventRingBuffer) {
        let mut record = LostRecord::default();
        ring_buffer.consume_record(header, &mut record);
        self.stats.add_lost(ring_buffer.name(), record.lost);
        self.listener.on_lost(ring_buffer.name(), record.lost);
    }

    fn function_for_stream(&self, stream_id: u64) -> u64 {
        *self
            .uprobes_ids_to_function
            .get(&stream_id)
            .expect("u(ret)probe sample with unregistered stream id")
    }

    fn defer_event(&self, event: DeferredEvent) {
        self.deferred_events.lock().unwrap().push(event);
    }

    fn open_context_switches(&mut self, all_cpus: &[i32], open_errors: &mut bool) {
        for &cpu in all_cpus {
            let fd = match context_switch_event_open(-1, cpu) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("Failed to open context switch event on cpu {cpu}: {e}");
                    *open_errors = true;
                    continue;
                }
            };
            let name = format!("context_switch_{cpu}");
            match PerfEventRingBuffer::open(fd.as_raw_fd(), CONTEXT_SWITCHES_RING_BUFFER_SIZE_KB, name)
            {
                Ok(ring_buffer) => {
                    self.tracing_fds.push(fd);
                    self.ring_buffers.push(ring_buffer);
                }
                Err(e) => {
                    // Dropping the fd closes it: nothing of this unit is kept.
                    warn!("Failed to mmap context switch ring buffer on cpu {cpu}: {e}");
                    *open_errors = true;
                }
            }
        }
    }

    fn open_mmap_task(&mut self, cpuset_cpus: &[i32], open_errors: &mut bool) {
        for &cpu in cpuset_cpus {
            let fd = match mmap_task_event_open(-1, cpu) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("Failed to open mmap/task event on cpu {cpu}: {e}");
                    *open_errors = true;
                    continue;
                }
            };
            let name = format!("mmap_task_{cpu}");
            match PerfEventRingBuffer::open(fd.as_raw_fd(), MMAP_TASK_RING_BUFFER_SIZE_KB, name) {
                Ok(ring_buffer) => {
                    self.tracing_fds.push(fd);
                    self.ring_buffers.push(ring_buffer);
                }
                Err(e) => {
                    warn!("Failed to mmap mmap/task ring buffer on cpu {cpu}: {e}");
                    *open_errors = true;
                }
            }
        }
    }

    fn open_sampling(&mut self, cpuset_cpus: &[i32], open_errors: &mut bool) {
        for &cpu in cpuset_cpus {
            let fd = match sample_event_open(self.config.sampling_period_ns, -1, cpu) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("Failed to open sampling event on cpu {cpu}: {e}");
                    *open_errors = true;
                    continue;
                }
            };
            let name = format!("sampling_{cpu}");
            match PerfEventRingBuffer::open(fd.as_raw_fd(), SAMPLING_RING_BUFFER_SIZE_KB, name) {
                Ok(ring_buffer) => {
                    self.tracing_fds.push(fd);
                    self.ring_buffers.push(ring_buffer);
                }
                Err(e) => {
                    warn!("Failed to mmap sampling ring buffer on cpu {cpu}: {e}");
                    *open_errors = true;
                }
            }
        }
    }

    /// Open the three GPU tracepoints on every cpu, each with its own ring
    /// buffer. All or nothing: any failure drops everything opened so far
    /// and the run continues with GPU tracing disabled.
    fn open_gpu_tracepoints(&mut self, all_cpus: &[i32]) -> bool {
        let mut tracepoint_ids = [0u32; 3];
        for (slot, (category, name)) in tracepoint_ids.iter_mut().zip(GPU_TRACEPOINTS) {
            match tracepoint_id(category, name) {
                Ok(id) => *slot = id,
                Err(e) => {
                    warn!("Failed to resolve tracepoint {category}:{name}: {e}");
                    return false;
                }
            }
        }

        let mut gpu_fds = Vec::new();
        let mut gpu_ring_buffers = Vec::new();
        for &cpu in all_cpus {
            for (category, name) in GPU_TRACEPOINTS {
                let fd = match tracepoint_event_open(category, name, -1, cpu) {
                    Ok(fd) => fd,
                    Err(e) => {
                        warn!("Failed to open tracepoint {category}:{name} on cpu {cpu}: {e}");
                        return false;
                    }
                };
                let buffer_name = format!("{category}:{name}_{cpu}");
                match PerfEventRingBuffer::open(
                    fd.as_raw_fd(),
                    GPU_TRACING_RING_BUFFER_SIZE_KB,
                    buffer_name,
                ) {
                    Ok(ring_buffer) => {
                        gpu_fds.push(fd);
                        gpu_ring_buffers.push(ring_buffer);
                    }
                    Err(e) => {
                        warn!("Failed to mmap {category}:{name} ring buffer on cpu {cpu}: {e}");
                        return false;
                    }
                }
            }
        }

        // Everything opened; commit the fds and ring buffers.
        for fd in gpu_fds {
            self.gpu_tracing_fds.insert(fd.as_raw_fd());
            self.tracing_fds.push(fd);
        }
        self.ring_buffers.extend(gpu_ring_buffers);
        self.gpu_event_processor = Some(GpuTracepointProcessor::new(
            tracepoint_ids[0],
            tracepoint_ids[1],
            tracepoint_ids[2],
            self.listener.clone(),
        ));
        true
    }

    /// Open a (uprobe, uretprobe) pair per instrumented function and cpu.
    /// A failure inside one function rolls that function back and skips
    /// it; other functions are kept. All u(ret)probes of a cpu share one
    /// ring buffer, owned by the first uprobe fd opened on that cpu.
    fn open_uprobes(
        &mut self,
        cpuset_cpus: &[i32],
        open_errors: &mut bool,
        uprobes_open_errors: &mut bool,
    ) {
        let functions = self.config.instrumented_functions.clone();
        let mut ring_buffer_fds_per_cpu: HashMap<i32, RawFd> = HashMap::new();

        for function in &functions {
            let mut uprobe_fds_per_cpu: HashMap<i32, PerfEventFile> = HashMap::new();
            let mut uretprobe_fds_per_cpu: HashMap<i32, PerfEventFile> = HashMap::new();
            let mut function_open_error = false;

            for &cpu in cpuset_cpus {
                match uprobe_stack_event_open(&function.binary_path, function.file_offset, -1, cpu)
                {
                    Ok(fd) => {
                        uprobe_fds_per_cpu.insert(cpu, fd);
                    }
                    Err(_) => {
                        function_open_error = true;
                        break;
                    }
                }
                match uretprobe_event_open(&function.binary_path, function.file_offset, -1, cpu) {
                    Ok(fd) => {
                        uretprobe_fds_per_cpu.insert(cpu, fd);
                    }
                    Err(_) => {
                        function_open_error = true;
                        break;
                    }
                }
            }

            // Bind each cpu's pair to the shared per-cpu ring buffer,
            // creating it on the first uprobe fd of the cpu. New ring
            // buffers stay local until the whole function has succeeded.
            let mut new_ring_buffers: Vec<PerfEventRingBuffer> = Vec::new();
            let mut new_ring_buffer_fds: HashMap<i32, RawFd> = HashMap::new();
            if !function_open_error {
                'cpus: for &cpu in cpuset_cpus {
                    let uprobe_fd = &uprobe_fds_per_cpu[&cpu];
                    let uretprobe_fd = &uretprobe_fds_per_cpu[&cpu];
                    let existing = ring_buffer_fds_per_cpu
                        .get(&cpu)
                        .or_else(|| new_ring_buffer_fds.get(&cpu));
                    match existing {
                        Some(&ring_buffer_fd) => {
                            if uprobe_fd.redirect_to(ring_buffer_fd).is_err()
                                || uretprobe_fd.redirect_to(ring_buffer_fd).is_err()
                            {
                                function_open_error = true;
                                break 'cpus;
                            }
                        }
                        None => {
                            let name = format!("uprobes_uretprobes_{cpu}");
                            match PerfEventRingBuffer::open(
                                uprobe_fd.as_raw_fd(),
                                UPROBES_RING_BUFFER_SIZE_KB,
                                name,
                            ) {
                                Ok(ring_buffer) => {
                                    new_ring_buffer_fds.insert(cpu, uprobe_fd.as_raw_fd());
                                    new_ring_buffers.push(ring_buffer);
                                    // Must happen after the ring buffer
                                    // has been mmap'd.
                                    if uretprobe_fd
                                        .redirect_to(uprobe_fd.as_raw_fd())
                                        .is_err()
                                    {
                                        function_open_error = true;
                                        break 'cpus;
                                    }
                                }
                                Err(_) => {
                                    function_open_error = true;
                                    break 'cpus;
                                }
                            }
                        }
                    }
                }
            }

            if function_open_error {
                // Dropping the per-cpu maps and local ring buffers closes
                // every fd and unmaps every buffer of this function.
                *open_errors = true;
                *uprobes_open_errors = true;
                error!(
                    "Failed to open u(ret)probes for function at {:#016x}",
                    function.virtual_address
                );
                continue;
            }

            // Read the stream id of every fd; the association with the
            // function is committed only if the whole unit succeeds.
            let mut stream_ids = Vec::new();
            let mut stream_id_error = false;
            for fd in uprobe_fds_per_cpu
                .values()
                .chain(uretprobe_fds_per_cpu.values())
            {
                match fd.stream_id() {
                    Ok(stream_id) => stream_ids.push(stream_id),
                    Err(e) => {
                        warn!("Failed to read perf event stream id: {e}");
                        stream_id_error = true;
                    }
                }
            }
            if stream_id_error {
                *open_errors = true;
                *uprobes_open_errors = true;
                continue;
            }
            for stream_id in stream_ids {
                self.uprobes_ids_to_function.insert(stream_id, function.id);
            }

            // Commit. Uretprobes go before uprobes: returns without
            // entries are supported but not the opposite, so returns must
            // be armed first.
            for (cpu, ring_buffer_fd) in new_ring_buffer_fds {
                ring_buffer_fds_per_cpu.insert(cpu, ring_buffer_fd);
                self.uprobes_fds.insert(ring_buffer_fd);
            }
            self.ring_buffers.extend(new_ring_buffers);
            self.tracing_fds
                .extend(uretprobe_fds_per_cpu.into_values());
            self.tracing_fds.extend(uprobe_fds_per_cpu.into_values());
        }
    }
}

fn process_deferred_events(
    mut reorderer: EventReorderer,
    mut visitor: UprobesUnwindingVisitor<FramePointerUnwinder>,
    deferred_events: Arc<Mutex<Vec<DeferredEvent>>>,
    stop: Arc<AtomicBool>,
) -> (
    EventReorderer,
    UprobesUnwindingVisitor<FramePointerUnwinder>,
) {
    let mut should_exit = false;
    while !should_exit {
        // Once the stop flag is observed no more events are being
        // produced, so one final swap drains everything still queued.
        should_exit = stop.load(Ordering::Acquire);
        let events = {
            let mut queue = deferred_events.lock().unwrap();
            mem::take(&mut *queue)
        };
        if events.is_empty() {
            thread::sleep(Duration::from_millis(IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS_MS));
        } else {
            for event in events {
                reorderer.add_event(event);
            }
            reorderer.process_old_events(&mut visitor);
        }
    }
    (reorderer, visitor)
}
