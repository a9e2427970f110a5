//! Drives the deferred-event pipeline (reorderer, unwinding visitor, GPU
//! correlator) through the public API with a recording listener.

mod common;

use std::sync::Arc;

use common::{ListenerCall, RecordingListener};
use proctrace::events::{
    DeferredEvent, DeferredPayload, RawTracepointSample, SampleRegs, StackSample, UprobeEvent,
    UretprobeEvent,
};
use proctrace::gpu::GpuTracepointProcessor;
use proctrace::maps::MapsSnapshot;
use proctrace::reorder::EventReorderer;
use proctrace::unwinding::{FramePointerUnwinder, UprobesUnwindingVisitor};
use proctrace::GpuJob;

fn visitor(
    listener: Arc<RecordingListener>,
) -> UprobesUnwindingVisitor<FramePointerUnwinder> {
    UprobesUnwindingVisitor::new(MapsSnapshot::default(), FramePointerUnwinder, listener)
}

fn uprobe(origin_fd: i32, tid: u32, time: u64, function_id: u64) -> DeferredEvent {
    DeferredEvent {
        origin_fd,
        payload: DeferredPayload::UprobeWithStack(UprobeEvent {
            tid,
            time,
            cpu: 0,
            function_id,
            sp: 0x7ffd_0000_0000,
            return_address: 0x4010_00,
        }),
    }
}

fn uretprobe(origin_fd: i32, tid: u32, time: u64, function_id: u64) -> DeferredEvent {
    DeferredEvent {
        origin_fd,
        payload: DeferredPayload::Uretprobe(UretprobeEvent {
            tid,
            time,
            cpu: 0,
            function_id,
        }),
    }
}

fn sample(origin_fd: i32, tid: u32, time: u64) -> DeferredEvent {
    DeferredEvent {
        origin_fd,
        payload: DeferredPayload::StackSample(StackSample {
            pid: tid,
            tid,
            time,
            stream_id: 1,
            cpu: 0,
            regs: Some(SampleRegs {
                bp: 0,
                sp: 0x1000,
                ip: 0x401000 + time,
            }),
            stack: Vec::new(),
        }),
    }
}

#[test]
fn matched_probe_pair_produces_one_function_call() {
    let listener = Arc::new(RecordingListener::default());
    let mut visitor = visitor(listener.clone());
    let mut reorderer = EventReorderer::new();

    reorderer.add_event(uprobe(10, 5, 1000, 0xF));
    reorderer.add_event(uretprobe(11, 5, 1050, 0xF));
    reorderer.process_all_events(&mut visitor);

    assert_eq!(
        listener.calls(),
        vec![ListenerCall::FunctionCall {
            tid: 5,
            function_id: 0xF,
            entry_time: 1000,
            exit_time: 1050,
        }]
    );
}

#[test]
fn dangling_uprobe_produces_no_function_call() {
    let listener = Arc::new(RecordingListener::default());
    let mut visitor = visitor(listener.clone());
    let mut reorderer = EventReorderer::new();

    reorderer.add_event(uprobe(10, 5, 2000, 0xF));
    reorderer.process_all_events(&mut visitor);

    assert!(listener.calls().is_empty());
}

#[test]
fn cross_buffer_events_reach_the_unwinder_in_time_order() {
    let listener = Arc::new(RecordingListener::default());
    let mut visitor = visitor(listener.clone());
    let mut reorderer = EventReorderer::new();

    // Buffer A delivers t=10 and t=30, buffer B delivers t=20.
    reorderer.add_event(sample(1, 7, 10));
    reorderer.add_event(sample(1, 7, 30));
    reorderer.add_event(sample(2, 7, 20));
    reorderer.process_old_events(&mut visitor);

    // t=30 may not be released until buffer B has progressed past it.
    let times = |calls: Vec<ListenerCall>| -> Vec<u64> {
        calls
            .into_iter()
            .map(|call| match call {
                ListenerCall::Callstack { time, .. } => time,
                other => panic!("unexpected listener call {other:?}"),
            })
            .collect()
    };
    assert_eq!(times(listener.calls()), vec![10, 20]);

    reorderer.add_event(sample(1, 7, 40));
    reorderer.add_event(sample(2, 7, 35));
    reorderer.process_old_events(&mut visitor);
    assert_eq!(times(listener.calls()), vec![10, 20, 30, 35]);
}

#[test]
fn shutdown_flush_preserves_per_buffer_order() {
    let listener = Arc::new(RecordingListener::default());
    let mut visitor = visitor(listener.clone());
    let mut reorderer = EventReorderer::new();

    reorderer.add_event(uprobe(10, 5, 100, 0xA));
    reorderer.add_event(sample(2, 5, 150));
    reorderer.add_event(uretprobe(11, 5, 200, 0xA));
    reorderer.process_all_events(&mut visitor);

    let calls = listener.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(calls[0], ListenerCall::Callstack { time: 150, .. }));
    assert!(matches!(
        calls[1],
        ListenerCall::FunctionCall {
            entry_time: 100,
            exit_time: 200,
            ..
        }
    ));
}

// Raw tracepoint payloads as the kernel lays them out: the 8-byte common
// header, then the per-event fields.
fn gpu_raw(tracepoint_id: u16, context: u32, seqno: u32, with_job_id: bool) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&tracepoint_id.to_ne_bytes());
    raw.extend_from_slice(&[0u8; 2]);
    raw.extend_from_slice(&0i32.to_ne_bytes());
    if with_job_id {
        raw.extend_from_slice(&1u64.to_ne_bytes());
    } else {
        raw.extend_from_slice(&0u32.to_ne_bytes());
    }
    raw.extend_from_slice(&0u32.to_ne_bytes()); // timeline
    raw.extend_from_slice(&context.to_ne_bytes());
    raw.extend_from_slice(&seqno.to_ne_bytes());
    raw.resize(raw.len().next_multiple_of(8), 0);
    raw
}

fn gpu_sample(tracepoint_id: u16, context: u32, seqno: u32, time: u64, tid: u32) -> RawTracepointSample {
    RawTracepointSample {
        pid: tid,
        tid,
        time,
        stream_id: 1,
        cpu: 0,
        raw: gpu_raw(tracepoint_id, context, seqno, tracepoint_id != 102),
    }
}

#[test]
fn gpu_tracepoint_triple_joins_into_one_job() {
    let listener = Arc::new(RecordingListener::default());
    let mut processor = GpuTracepointProcessor::new(100, 101, 102, listener.clone());

    processor.push_event(&gpu_sample(100, 3, 42, 500, 7));
    processor.push_event(&gpu_sample(101, 3, 42, 600, 0));
    processor.push_event(&gpu_sample(102, 3, 42, 900, 0));

    assert_eq!(
        listener.calls(),
        vec![ListenerCall::GpuJobDone(GpuJob {
            submit_time: 500,
            schedule_time: 600,
            signal_time: 900,
            context: 3,
            seqno: 42,
            tid: 7,
        })]
    );
}

#[test]
fn gpu_subset_does_not_join() {
    let listener = Arc::new(RecordingListener::default());
    let mut processor = GpuTracepointProcessor::new(100, 101, 102, listener.clone());

    processor.push_event(&gpu_sample(100, 3, 42, 500, 7));
    processor.push_event(&gpu_sample(101, 3, 42, 600, 0));

    assert!(listener.calls().is_empty());
}
