use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use proctrace::{GpuJob, InstrumentedFunction, Tracer, TracerConfig, TracerListener};

#[derive(Debug, Parser)]
#[command(name = "proctrace", about = "Whole-process tracer on Linux perf events")]
struct Command {
    /// Pid of the process to trace
    #[arg(short, long)]
    pid: u32,
    /// Callstack sampling period in nanoseconds
    #[arg(long, default_value = "1000000")]
    sampling_period_ns: u64,
    /// Seconds to trace (0 = until Ctrl-C)
    #[arg(short, long, default_value = "0")]
    duration: u64,
    /// Don't record context switches
    #[arg(long)]
    no_context_switches: bool,
    /// Don't sample callstacks
    #[arg(long)]
    no_callstacks: bool,
    /// Record GPU driver tracepoint events (system-wide)
    #[arg(long)]
    gpu: bool,
    /// Function to instrument, as binary_path:file_offset:virtual_address
    /// with hexadecimal offsets, e.g. /usr/bin/target:0x1b40:0x401b40
    #[arg(short, long)]
    function: Vec<String>,
}

/// Listener that logs every event, for running the tracer standalone.
struct LogListener;

impl TracerListener for LogListener {
    fn on_tid(&self, tid: u32) {
        info!("tid {tid}");
    }

    fn on_context_switch_in(&self, tid: u32, cpu: u32, time: u64) {
        info!("switch in: tid {tid} cpu {cpu} t {time}");
    }

    fn on_context_switch_out(&self, tid: u32, cpu: u32, time: u64) {
        info!("switch out: tid {tid} cpu {cpu} t {time}");
    }

    fn on_callstack(&self, tid: u32, time: u64, frames: &[u64]) {
        info!("callstack: tid {tid} t {time} {} frames", frames.len());
    }

    fn on_function_call(&self, tid: u32, function_id: u64, entry_time: u64, exit_time: u64) {
        info!(
            "function call: tid {tid} function {function_id:#x} t {entry_time}..{exit_time}"
        );
    }

    fn on_gpu_job(&self, job: &GpuJob) {
        info!(
            "gpu job: context {} seqno {} submit {} schedule {} signal {}",
            job.context, job.seqno, job.submit_time, job.schedule_time, job.signal_time
        );
    }

    fn on_lost(&self, ring_buffer_name: &str, count: u64) {
        info!("lost {count} records from {ring_buffer_name}");
    }
}

fn parse_hex(value: &str) -> Result<u64> {
    let value = value.trim_start_matches("0x");
    u64::from_str_radix(value, 16).with_context(|| format!("Bad hexadecimal value '{value}'"))
}

/// Parse binary_path:file_offset:virtual_address. The path may itself
/// contain colons, so split from the right.
fn parse_function(spec: &str, id: u64) -> Result<InstrumentedFunction> {
    let Some((rest, virtual_address)) = spec.rsplit_once(':') else {
        bail!("Bad function spec '{spec}'");
    };
    let Some((binary_path, file_offset)) = rest.rsplit_once(':') else {
        bail!("Bad function spec '{spec}'");
    };
    Ok(InstrumentedFunction {
        id,
        binary_path: binary_path.to_string(),
        file_offset: parse_hex(file_offset)?,
        virtual_address: parse_hex(virtual_address)?,
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opts = Command::parse();

    let mut instrumented_functions = Vec::new();
    for (index, spec) in opts.function.iter().enumerate() {
        instrumented_functions.push(parse_function(spec, index as u64)?);
    }

    let config = TracerConfig {
        pid: opts.pid,
        sampling_period_ns: opts.sampling_period_ns,
        trace_context_switches: !opts.no_context_switches,
        trace_callstacks: !opts.no_callstacks,
        trace_instrumented_functions: !instrumented_functions.is_empty(),
        trace_gpu_driver_events: opts.gpu,
        instrumented_functions,
    };

    let exit_requested = Arc::new(AtomicBool::new(false));

    let ctrlc_flag = exit_requested.clone();
    ctrlc::set_handler(move || {
        ctrlc_flag.store(true, Ordering::Release);
    })
    .context("Failed to install the Ctrl-C handler")?;

    if opts.duration > 0 {
        let timer_flag = exit_requested.clone();
        let duration = opts.duration;
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(duration));
            timer_flag.store(true, Ordering::Release);
        });
    }

    let mut tracer = Tracer::new(config, Arc::new(LogListener));
    tracer.run(exit_requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_specs() {
        let function = parse_function("/usr/bin/target:0x1b40:0x401b40", 3).unwrap();
        assert_eq!(function.id, 3);
        assert_eq!(function.binary_path, "/usr/bin/target");
        assert_eq!(function.file_offset, 0x1b40);
        assert_eq!(function.virtual_address, 0x401b40);

        assert!(parse_function("no-offsets", 0).is_err());
        assert!(parse_function("/bin/x:nothex:0x1", 0).is_err());
    }
}
