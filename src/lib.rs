//! proctrace library - whole-process tracing on Linux perf events.
//!
//! The tracer attaches to a running process and streams context switches,
//! sampled callstacks, instrumented-function calls and GPU driver events
//! to a [`TracerListener`].
//!
//! # Modules
//!
//! - [`tracer`] - the engine: fd lifecycle, poll loop, record dispatch
//! - [`ringbuf`] - one mmap'd kernel perf ring buffer
//! - [`event_open`] - typed perf_event_open wrappers
//! - [`events`] - wire-record decoding and typed events
//! - [`reorder`] - cross-buffer time-ordered merge
//! - [`unwinding`] - callstack unwinding and uprobe stitching
//! - [`gpu`] - GPU tracepoint correlation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::atomic::AtomicBool;
//! use std::sync::Arc;
//! use proctrace::{Tracer, TracerConfig};
//!
//! # struct Printer;
//! # impl proctrace::TracerListener for Printer {
//! #     fn on_tid(&self, _: u32) {}
//! #     fn on_context_switch_in(&self, _: u32, _: u32, _: u64) {}
//! #     fn on_context_switch_out(&self, _: u32, _: u32, _: u64) {}
//! #     fn on_callstack(&self, _: u32, _: u64, _: &[u64]) {}
//! #     fn on_function_call(&self, _: u32, _: u64, _: u64, _: u64) {}
//! #     fn on_gpu_job(&self, _: &proctrace::GpuJob) {}
//! # }
//! let config = TracerConfig {
//!     pid: 12345,
//!     ..Default::default()
//! };
//! let exit_requested = Arc::new(AtomicBool::new(false));
//! let mut tracer = Tracer::new(config, Arc::new(Printer));
//! tracer.run(exit_requested).expect("tracing failed");
//! ```

pub mod event_open;
pub mod events;
pub mod gpu;
pub mod listener;
pub mod maps;
pub mod perf;
pub mod reorder;
pub mod ringbuf;
pub mod stats;
pub mod tracer;
pub mod unwinding;

pub use gpu::GpuJob;
pub use listener::TracerListener;
pub use tracer::{InstrumentedFunction, Tracer, TracerConfig};
