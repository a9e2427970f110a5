use crate::gpu::GpuJob;

/// The sole downstream interface of the tracer. Callbacks are invoked from
/// the poll thread (context switches, tids, gpu jobs, losses) and from the
/// deferred-events thread (callstacks, function calls), so implementations
/// must tolerate concurrent invocation from two threads.
///
/// Context switches are delivered as the poll thread drains them and are
/// not globally time-ordered with respect to callstacks; rely on the
/// timestamps when a total order matters.
pub trait TracerListener: Send + Sync {
    /// A thread of the target is live: called once per thread at start and
    /// again for every subsequent fork.
    fn on_tid(&self, tid: u32);

    fn on_context_switch_in(&self, tid: u32, cpu: u32, time: u64);
    fn on_context_switch_out(&self, tid: u32, cpu: u32, time: u64);

    /// A time-ordered callstack for `tid`, sampled or synthesized.
    fn on_callstack(&self, tid: u32, time: u64, frames: &[u64]);

    /// An instrumented function completed: its uretprobe matched an active
    /// uprobe on the thread's stack.
    fn on_function_call(&self, tid: u32, function_id: u64, entry_time: u64, exit_time: u64);

    /// A GPU job completed its submit/schedule/signal lifecycle.
    fn on_gpu_job(&self, job: &GpuJob);

    /// The kernel dropped `count` records from the named ring buffer.
    /// Losses are also accounted in the tracer statistics.
    fn on_lost(&self, _ring_buffer_name: &str, _count: u64) {}
}
