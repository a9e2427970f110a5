use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use plain::Plain;

use crate::events::RawTracepointSample;
use crate::listener::TracerListener;

/// Entries with no fence-signaled event after this long are dropped to cap
/// the correlation table. Far beyond any plausible submit-to-fence latency.
pub const GPU_JOB_TTL_NS: u64 = 10_000_000_000;

/// Common header at the start of every raw tracepoint payload.
/// `common_type` is the tracefs id of the tracepoint.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracepointCommon {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
}

/// amdgpu:amdgpu_cs_ioctl — a command buffer was submitted by the
/// application.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AmdgpuCsIoctlPayload {
    pub common: TracepointCommon,
    pub sched_job_id: u64,
    pub timeline: u32,
    pub context: u32,
    pub seqno: u32,
}

/// amdgpu:amdgpu_sched_run_job — the job was scheduled onto the hardware.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct AmdgpuSchedRunJobPayload {
    pub common: TracepointCommon,
    pub sched_job_id: u64,
    pub timeline: u32,
    pub context: u32,
    pub seqno: u32,
}

/// dma_fence:dma_fence_signaled — the job's fence signaled completion.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaFenceSignaledPayload {
    pub common: TracepointCommon,
    pub driver: u32,
    pub timeline: u32,
    pub context: u32,
    pub seqno: u32,
}

unsafe impl Plain for TracepointCommon {}
unsafe impl Plain for AmdgpuCsIoctlPayload {}
unsafe impl Plain for AmdgpuSchedRunJobPayload {}
unsafe impl Plain for DmaFenceSignaledPayload {}

/// A completed GPU job timeline: one submit, one schedule and one fence
/// signal sharing (context, seqno).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuJob {
    pub submit_time: u64,
    pub schedule_time: u64,
    pub signal_time: u64,
    pub context: u32,
    pub seqno: u32,
    pub tid: u32,
}

#[derive(Debug, Default)]
struct PartialGpuJob {
    submit_time: Option<u64>,
    schedule_time: Option<u64>,
    signal_time: Option<u64>,
    tid: u32,
    first_seen_ns: u64,
}

/// Joins the three GPU driver tracepoints into end-to-end job timelines.
///
/// Keyed by (context, seqno). Tracepoints may arrive out of order across
/// cpus, so a schedule or signal without a prior submit still creates an
/// entry. A job is emitted and dropped as soon as all three times are
/// known; unsignaled entries are garbage-collected after a TTL.
pub struct GpuTracepointProcessor {
    cs_ioctl_id: u32,
    sched_run_job_id: u32,
    fence_signaled_id: u32,
    jobs: HashMap<(u32, u32), PartialGpuJob>,
    last_sweep_ns: u64,
    listener: Arc<dyn TracerListener>,
}

impl GpuTracepointProcessor {
    pub fn new(
        cs_ioctl_id: u32,
        sched_run_job_id: u32,
        fence_signaled_id: u32,
        listener: Arc<dyn TracerListener>,
    ) -> Self {
        GpuTracepointProcessor {
            cs_ioctl_id,
            sched_run_job_id,
            fence_signaled_id,
            jobs: HashMap::new(),
            last_sweep_ns: 0,
            listener,
        }
    }

    pub fn push_event(&mut self, sample: &RawTracepointSample) {
        let mut common = TracepointCommon::default();
        if plain::copy_from_bytes(&mut common, &sample.raw).is_err() {
            debug!("Truncated tracepoint payload ({} bytes)", sample.raw.len());
            return;
        }

        let tracepoint_id = common.common_type as u32;
        if tracepoint_id == self.cs_ioctl_id {
            let mut payload = AmdgpuCsIoctlPayload::default();
            if plain::copy_from_bytes(&mut payload, &sample.raw).is_err() {
                return;
            }
            let job = self.job_entry(payload.context, payload.seqno, sample.time);
            job.submit_time = Some(sample.time);
            job.tid = sample.tid;
        } else if tracepoint_id == self.sched_run_job_id {
            let mut payload = AmdgpuSchedRunJobPayload::default();
            if plain::copy_from_bytes(&mut payload, &sample.raw).is_err() {
                return;
            }
            let job = self.job_entry(payload.context, payload.seqno, sample.time);
            job.schedule_time = Some(sample.time);
        } else if tracepoint_id == self.fence_signaled_id {
            let mut payload = DmaFenceSignaledPayload::default();
            if plain::copy_from_bytes(&mut payload, &sample.raw).is_err() {
                return;
            }
            let job = self.job_entry(payload.context, payload.seqno, sample.time);
            job.signal_time = Some(sample.time);
        } else {
            debug!("Tracepoint sample with unknown id {tracepoint_id}");
            return;
        }

        self.emit_completed();
        self.sweep_expired(sample.time);
    }

    fn job_entry(&mut self, context: u32, seqno: u32, now_ns: u64) -> &mut PartialGpuJob {
        self.jobs.entry((context, seqno)).or_insert(PartialGpuJob {
            first_seen_ns: now_ns,
            ..Default::default()
        })
    }

    fn emit_completed(&mut self) {
        let completed: Vec<(u32, u32)> = self
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.submit_time.is_some()
                    && job.schedule_time.is_some()
                    && job.signal_time.is_some()
            })
            .map(|(key, _)| *key)
            .collect();
        for (context, seqno) in completed {
            let job = self.jobs.remove(&(context, seqno)).unwrap();
            self.listener.on_gpu_job(&GpuJob {
                submit_time: job.submit_time.unwrap(),
                schedule_time: job.schedule_time.unwrap(),
                signal_time: job.signal_time.unwrap(),
                context,
                seqno,
                tid: job.tid,
            });
        }
    }

    fn sweep_expired(&mut self, now_ns: u64) {
        if now_ns.saturating_sub(self.last_sweep_ns) < GPU_JOB_TTL_NS {
            return;
        }
        self.last_sweep_ns = now_ns;
        self.jobs
            .retain(|_, job| now_ns.saturating_sub(job.first_seen_ns) < GPU_JOB_TTL_NS);
    }
}
