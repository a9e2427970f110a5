//! Common test utilities for proctrace integration tests.

use std::sync::Mutex;

use proctrace::{GpuJob, TracerListener};

/// One observed listener callback, in invocation order.
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
pub enum ListenerCall {
    Tid(u32),
    SwitchIn { tid: u32, cpu: u32, time: u64 },
    SwitchOut { tid: u32, cpu: u32, time: u64 },
    Callstack { tid: u32, time: u64, frames: Vec<u64> },
    FunctionCall { tid: u32, function_id: u64, entry_time: u64, exit_time: u64 },
    GpuJobDone(GpuJob),
    Lost { ring_buffer_name: String, count: u64 },
}

/// Listener that records every callback for later assertions.
#[derive(Default)]
pub struct RecordingListener {
    calls: Mutex<Vec<ListenerCall>>,
}

impl RecordingListener {
    pub fn calls(&self) -> Vec<ListenerCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl TracerListener for RecordingListener {
    fn on_tid(&self, tid: u32) {
        self.calls.lock().unwrap().push(ListenerCall::Tid(tid));
    }

    fn on_context_switch_in(&self, tid: u32, cpu: u32, time: u64) {
        self.calls
            .lock()
            .unwrap()
            .push(ListenerCall::SwitchIn { tid, cpu, time });
    }

    fn on_context_switch_out(&self, tid: u32, cpu: u32, time: u64) {
        self.calls
            .lock()
            .unwrap()
            .push(ListenerCall::SwitchOut { tid, cpu, time });
    }

    fn on_callstack(&self, tid: u32, time: u64, frames: &[u64]) {
        self.calls.lock().unwrap().push(ListenerCall::Callstack {
            tid,
            time,
            frames: frames.to_vec(),
        });
    }

    fn on_function_call(&self, tid: u32, function_id: u64, entry_time: u64, exit_time: u64) {
        self.calls.lock().unwrap().push(ListenerCall::FunctionCall {
            tid,
            function_id,
            entry_time,
            exit_time,
        });
    }

    fn on_gpu_job(&self, job: &GpuJob) {
        self.calls
            .lock()
            .unwrap()
            .push(ListenerCall::GpuJobDone(job.clone()));
    }

    fn on_lost(&self, ring_buffer_name: &str, count: u64) {
        self.calls.lock().unwrap().push(ListenerCall::Lost {
            ring_buffer_name: ring_buffer_name.to_string(),
            count,
        });
    }
}
