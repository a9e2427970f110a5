use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::events::{
    DeferredEvent, DeferredPayload, MapsRefreshEvent, SampleRegs, StackSample, UprobeEvent,
    UretprobeEvent,
};
use crate::listener::TracerListener;
use crate::maps::MapsSnapshot;
use crate::reorder::DeferredEventVisitor;

const MAX_UNWOUND_FRAMES: usize = 128;

/// One unwound frame. For frames recovered from the stack,
/// `return_address_slot` is the address of the stack slot the return
/// address was loaded from; the leaf frame (the sampled ip) has none.
/// The slot is what ties a frame to the uprobe whose uretprobe hijacked
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwoundFrame {
    pub ip: u64,
    pub return_address_slot: Option<u64>,
}

/// Reconstructs a user callstack from a raw sample and a memory map
/// snapshot. A pure function of its inputs.
pub trait Unwinder: Send {
    fn unwind(&self, regs: &SampleRegs, stack: &[u8], maps: &MapsSnapshot) -> Vec<UnwoundFrame>;
}

/// Frame-pointer unwinder. Walks the saved-bp chain through the stack
/// snapshot, which starts at the sampled sp. Frames are reported innermost
/// first, beginning with the sampled ip.
#[derive(Debug, Default)]
pub struct FramePointerUnwinder;

impl FramePointerUnwinder {
    fn stack_u64(stack: &[u8], offset: u64) -> Option<u64> {
        let offset = offset as usize;
        let bytes = stack.get(offset..offset + 8)?;
        Some(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }
}

impl Unwinder for FramePointerUnwinder {
    fn unwind(&self, regs: &SampleRegs, stack: &[u8], _maps: &MapsSnapshot) -> Vec<UnwoundFrame> {
        let mut frames = vec![UnwoundFrame {
            ip: regs.ip,
            return_address_slot: None,
        }];
        let mut bp = regs.bp;
        while frames.len() < MAX_UNWOUND_FRAMES {
            if bp < regs.sp {
                break;
            }
            // A frame is [saved bp, return address] at bp.
            let offset = bp - regs.sp;
            let (Some(saved_bp), Some(return_address)) = (
                Self::stack_u64(stack, offset),
                Self::stack_u64(stack, offset + 8),
            ) else {
                break;
            };
            if return_address == 0 {
                break;
            }
            frames.push(UnwoundFrame {
                ip: return_address,
                return_address_slot: Some(bp + 8),
            });
            if saved_bp <= bp {
                break;
            }
            bp = saved_bp;
        }
        frames
    }
}

/// A function entry awaiting its matching return. `sp` and
/// `return_address` come from the entry sample and identify the stack slot
/// whose content the uretprobe trampoline has hijacked.
#[derive(Debug, Clone)]
struct OpenUprobe {
    function_id: u64,
    entry_time: u64,
    sp: u64,
    return_address: u64,
}

/// Consumes the time-ordered deferred-event stream and reconstructs
/// per-thread call state.
///
/// Entering an instrumented function makes the kernel replace the saved
/// return address on the stack with the uretprobe trampoline, so any stack
/// sample taken inside such a function unwinds into the trampoline instead
/// of the real call site. The visitor keeps, per thread, the stack of
/// active uprobes together with the return frames their entry samples
/// captured, and splices those saved return sites back into unwound
/// samples.
pub struct UprobesUnwindingVisitor<U: Unwinder> {
    listener: Arc<dyn TracerListener>,
    unwinder: U,
    maps: MapsSnapshot,
    open_uprobes_per_thread: HashMap<u32, Vec<OpenUprobe>>,
}

impl<U: Unwinder> UprobesUnwindingVisitor<U> {
    pub fn new(initial_maps: MapsSnapshot, unwinder: U, listener: Arc<dyn TracerListener>) -> Self {
        UprobesUnwindingVisitor {
            listener,
            unwinder,
            maps: initial_maps,
            open_uprobes_per_thread: HashMap::new(),
        }
    }

    fn handle_uprobe(&mut self, event: UprobeEvent) {
        self.open_uprobes_per_thread
            .entry(event.tid)
            .or_default()
            .push(OpenUprobe {
                function_id: event.function_id,
                entry_time: event.time,
                sp: event.sp,
                return_address: event.return_address,
            });
    }

    fn handle_uretprobe(&mut self, event: UretprobeEvent) {
        let Some(open_uprobes) = self.open_uprobes_per_thread.get_mut(&event.tid) else {
            debug!("Uretprobe on tid {} with no active uprobe", event.tid);
            return;
        };
        let Some(open) = open_uprobes.pop() else {
            debug!("Uretprobe on tid {} with no active uprobe", event.tid);
            return;
        };
        self.listener
            .on_function_call(event.tid, open.function_id, open.entry_time, event.time);
    }

    fn handle_sample(&mut self, sample: StackSample) {
        let Some(regs) = sample.regs else {
            // The sample interrupted the kernel; no user state to unwind.
            return;
        };
        let mut frames = self.unwinder.unwind(&regs, &sample.stack, &self.maps);
        self.stitch(sample.tid, &mut frames);
        let ips: Vec<u64> = frames.iter().map(|frame| frame.ip).collect();
        self.listener.on_callstack(sample.tid, sample.time, &ips);
    }

    /// Replace trampoline frames with the return sites the active uprobes
    /// saved at entry. A frame is a trampoline frame iff its return
    /// address was loaded from the stack slot an active uprobe recorded as
    /// its sp at entry: that is the slot the uretprobe hijacked. Frames
    /// whose slot matches no active uprobe are left alone, whether or not
    /// they resolve in the current maps.
    fn stitch(&self, tid: u32, frames: &mut [UnwoundFrame]) {
        let Some(open_uprobes) = self.open_uprobes_per_thread.get(&tid) else {
            return;
        };
        if open_uprobes.is_empty() {
            return;
        }
        for frame in frames.iter_mut() {
            let Some(slot) = frame.return_address_slot else {
                continue;
            };
            if let Some(open) = open_uprobes.iter().find(|open| open.sp == slot) {
                frame.ip = open.return_address;
            }
        }
    }

    fn handle_maps_refresh(&mut self, event: MapsRefreshEvent) {
        self.maps = event.snapshot;
    }
}

impl<U: Unwinder> DeferredEventVisitor for UprobesUnwindingVisitor<U> {
    fn visit(&mut self, event: DeferredEvent) {
        match event.payload {
            DeferredPayload::UprobeWithStack(e) => self.handle_uprobe(e),
            DeferredPayload::Uretprobe(e) => self.handle_uretprobe(e),
            DeferredPayload::StackSample(e) => self.handle_sample(e),
            DeferredPayload::MapsRefresh(e) => self.handle_maps_refresh(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        callstacks: Mutex<Vec<(u32, u64, Vec<u64>)>>,
        function_calls: Mutex<Vec<(u32, u64, u64, u64)>>,
    }

    impl TracerListener for Recorder {
        fn on_tid(&self, _tid: u32) {}
        fn on_context_switch_in(&self, _tid: u32, _cpu: u32, _time: u64) {}
        fn on_context_switch_out(&self, _tid: u32, _cpu: u32, _time: u64) {}
        fn on_callstack(&self, tid: u32, time: u64, frames: &[u64]) {
            self.callstacks
                .lock()
                .unwrap()
                .push((tid, time, frames.to_vec()));
        }
        fn on_function_call(&self, tid: u32, function_id: u64, entry_time: u64, exit_time: u64) {
            self.function_calls
                .lock()
                .unwrap()
                .push((tid, function_id, entry_time, exit_time));
        }
        fn on_gpu_job(&self, _job: &crate::gpu::GpuJob) {}
    }

    fn visitor(
        maps: MapsSnapshot,
    ) -> (
        UprobesUnwindingVisitor<FramePointerUnwinder>,
        Arc<Recorder>,
    ) {
        let recorder = Arc::new(Recorder::default());
        let visitor =
            UprobesUnwindingVisitor::new(maps, FramePointerUnwinder, recorder.clone());
        (visitor, recorder)
    }

    fn uprobe(tid: u32, time: u64, function_id: u64, sp: u64) -> DeferredEvent {
        DeferredEvent {
            origin_fd: 1,
            payload: DeferredPayload::UprobeWithStack(UprobeEvent {
                tid,
                time,
                cpu: 0,
                function_id,
                sp,
                return_address: 0x55f0aa000500,
            }),
        }
    }

    fn uretprobe(tid: u32, time: u64, function_id: u64) -> DeferredEvent {
        DeferredEvent {
            origin_fd: 1,
            payload: DeferredPayload::Uretprobe(UretprobeEvent {
                tid,
                time,
                cpu: 0,
                function_id,
            }),
        }
    }

    const TEST_MAPS: &str =
        "55f0aa000000-55f0aa010000 r-xp 00000000 fd:01 1 /usr/bin/target\n";

    #[test]
    fn matched_probes_emit_one_function_call() {
        let (mut visitor, recorder) = visitor(MapsSnapshot::default());
        visitor.visit(uprobe(5, 1000, 0xF, 0x1000));
        visitor.visit(uretprobe(5, 1050, 0xF));

        let calls = recorder.function_calls.lock().unwrap();
        assert_eq!(*calls, vec![(5, 0xF, 1000, 1050)]);
    }

    #[test]
    fn dangling_uprobe_emits_nothing() {
        let (mut visitor, recorder) = visitor(MapsSnapshot::default());
        visitor.visit(uprobe(5, 2000, 0xF, 0x1000));
        assert!(recorder.function_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn uretprobe_without_entry_emits_nothing() {
        let (mut visitor, recorder) = visitor(MapsSnapshot::default());
        visitor.visit(uretprobe(5, 3000, 0xF));
        assert!(recorder.function_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn nested_probes_match_innermost_first() {
        let (mut visitor, recorder) = visitor(MapsSnapshot::default());
        visitor.visit(uprobe(5, 100, 0xA, 0x1038));
        visitor.visit(uprobe(5, 110, 0xB, 0x1018));
        visitor.visit(uretprobe(5, 120, 0xB));
        visitor.visit(uretprobe(5, 130, 0xA));

        let calls = recorder.function_calls.lock().unwrap();
        assert_eq!(*calls, vec![(5, 0xB, 110, 120), (5, 0xA, 100, 130)]);
    }

    #[test]
    fn unwinds_a_frame_pointer_chain() {
        // Stack snapshot starting at sp = 0x1000; bp = 0x1010 points at
        // [saved bp = 0x1020, ret = frame1]; 0x1020 holds
        // [saved bp = 0, ret = frame2].
        let mut stack = vec![0u8; 0x40];
        stack[0x10..0x18].copy_from_slice(&0x1020u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0x55f0aa000200u64.to_ne_bytes());
        stack[0x20..0x28].copy_from_slice(&0u64.to_ne_bytes());
        stack[0x28..0x30].copy_from_slice(&0x55f0aa000300u64.to_ne_bytes());

        let maps = MapsSnapshot::parse(TEST_MAPS);
        let (mut visitor, recorder) = visitor(maps);
        visitor.visit(DeferredEvent {
            origin_fd: 2,
            payload: DeferredPayload::StackSample(StackSample {
                pid: 5,
                tid: 5,
                time: 42,
                stream_id: 9,
                cpu: 0,
                regs: Some(SampleRegs {
                    bp: 0x1010,
                    sp: 0x1000,
                    ip: 0x55f0aa000100,
                }),
                stack,
            }),
        });

        let callstacks = recorder.callstacks.lock().unwrap();
        assert_eq!(
            *callstacks,
            vec![(
                5,
                42,
                vec![0x55f0aa000100, 0x55f0aa000200, 0x55f0aa000300]
            )]
        );
    }

    #[test]
    fn stitches_trampoline_frames_to_saved_return_sites() {
        // The frame's return address (the trampoline, 0xdead000) sits in
        // the slot at bp + 8 = 0x1018, which is exactly the sp the active
        // uprobe recorded at entry: the slot the uretprobe hijacked. The
        // saved return site replaces it.
        let mut stack = vec![0u8; 0x20];
        stack[0x10..0x18].copy_from_slice(&0u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0xdead000u64.to_ne_bytes());

        let maps = MapsSnapshot::parse(TEST_MAPS);
        let (mut visitor, recorder) = visitor(maps);
        visitor.visit(uprobe(5, 10, 0xF, 0x1018));
        visitor.visit(DeferredEvent {
            origin_fd: 2,
            payload: DeferredPayload::StackSample(StackSample {
                pid: 5,
                tid: 5,
                time: 20,
                stream_id: 9,
                cpu: 0,
                regs: Some(SampleRegs {
                    bp: 0x1010,
                    sp: 0x1000,
                    ip: 0x55f0aa000100,
                }),
                stack,
            }),
        });

        let callstacks = recorder.callstacks.lock().unwrap();
        assert_eq!(
            *callstacks,
            vec![(5, 20, vec![0x55f0aa000100, 0x55f0aa000500])]
        );
    }

    #[test]
    fn unresolvable_frame_with_no_matching_slot_is_left_alone() {
        // The return address 0xdead000 resolves to nothing in the current
        // maps (think a just-mmap'd library before the snapshot refresh),
        // but its slot (0x1018) is not the sp of any active uprobe, so it
        // must not be mistaken for a trampoline and rewritten.
        let mut stack = vec![0u8; 0x20];
        stack[0x10..0x18].copy_from_slice(&0u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0xdead000u64.to_ne_bytes());

        let maps = MapsSnapshot::parse(TEST_MAPS);
        let (mut visitor, recorder) = visitor(maps);
        visitor.visit(uprobe(5, 10, 0xF, 0x2018));
        visitor.visit(DeferredEvent {
            origin_fd: 2,
            payload: DeferredPayload::StackSample(StackSample {
                pid: 5,
                tid: 5,
                time: 20,
                stream_id: 9,
                cpu: 0,
                regs: Some(SampleRegs {
                    bp: 0x1010,
                    sp: 0x1000,
                    ip: 0x55f0aa000100,
                }),
                stack,
            }),
        });

        let callstacks = recorder.callstacks.lock().unwrap();
        assert_eq!(
            *callstacks,
            vec![(5, 20, vec![0x55f0aa000100, 0xdead000])]
        );
    }

    #[test]
    fn stitching_nested_probes_keeps_slots_aligned() {
        // Two active uprobes hijacked the slots at 0x1018 (inner, entered
        // second) and 0x1038 (outer). Both trampoline frames map back to
        // their own saved return sites, keyed by slot address rather than
        // by position.
        let mut stack = vec![0u8; 0x40];
        stack[0x10..0x18].copy_from_slice(&0x1030u64.to_ne_bytes());
        stack[0x18..0x20].copy_from_slice(&0xdead000u64.to_ne_bytes());
        stack[0x30..0x38].copy_from_slice(&0u64.to_ne_bytes());
        stack[0x38..0x40].copy_from_slice(&0xdead000u64.to_ne_bytes());

        let (mut visitor, recorder) = visitor(MapsSnapshot::parse(TEST_MAPS));
        visitor.visit(DeferredEvent {
            origin_fd: 1,
            payload: DeferredPayload::UprobeWithStack(UprobeEvent {
                tid: 5,
                time: 10,
                cpu: 0,
                function_id: 0xA,
                sp: 0x1038,
                return_address: 0x55f0aa000700,
            }),
        });
        visitor.visit(DeferredEvent {
            origin_fd: 1,
            payload: DeferredPayload::UprobeWithStack(UprobeEvent {
                tid: 5,
                time: 11,
                cpu: 0,
                function_id: 0xB,
                sp: 0x1018,
                return_address: 0x55f0aa000600,
            }),
        });
        visitor.visit(DeferredEvent {
            origin_fd: 2,
            payload: DeferredPayload::StackSample(StackSample {
                pid: 5,
                tid: 5,
                time: 20,
                stream_id: 9,
                cpu: 0,
                regs: Some(SampleRegs {
                    bp: 0x1010,
                    sp: 0x1000,
                    ip: 0x55f0aa000100,
                }),
                stack,
            }),
        });

        let callstacks = recorder.callstacks.lock().unwrap();
        assert_eq!(
            *callstacks,
            vec![(
                5,
                20,
                vec![0x55f0aa000100, 0x55f0aa000600, 0x55f0aa000700]
            )]
        );
    }

    #[test]
    fn maps_refresh_replaces_the_snapshot() {
        let (mut visitor, recorder) = visitor(MapsSnapshot::default());
        visitor.visit(DeferredEvent {
            origin_fd: 3,
            payload: DeferredPayload::MapsRefresh(MapsRefreshEvent {
                time: 5,
                snapshot: MapsSnapshot::parse(TEST_MAPS),
            }),
        });

        // After the refresh the sampled ip resolves and a single-frame
        // stack comes out (bp below sp stops the walk immediately).
        visitor.visit(DeferredEvent {
            origin_fd: 2,
            payload: DeferredPayload::StackSample(StackSample {
                pid: 5,
                tid: 5,
                time: 6,
                stream_id: 9,
                cpu: 0,
                regs: Some(SampleRegs {
                    bp: 0,
                    sp: 0x1000,
                    ip: 0x55f0aa000100,
                }),
                stack: vec![0u8; 8],
            }),
        });

        let callstacks = recorder.callstacks.lock().unwrap();
        assert_eq!(*callstacks, vec![(5, 6, vec![0x55f0aa000100])]);
    }
}
