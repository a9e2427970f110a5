use std::collections::HashMap;

use log::info;

/// How often accumulated event counts are turned into rates and logged.
pub const EVENT_COUNT_WINDOW_S: u64 = 5;

/// Counters for one statistics window. Updated only from the poll thread;
/// reset on every window rollover.
#[derive(Debug, Default)]
pub struct TracerStats {
    window_begin_ns: u64,
    pub sched_switch_count: u64,
    pub sample_count: u64,
    pub uprobes_count: u64,
    pub gpu_events_count: u64,
    pub lost_count: u64,
    pub lost_count_per_buffer: HashMap<String, u64>,
}

impl TracerStats {
    pub fn reset(&mut self, now_ns: u64) {
        *self = TracerStats {
            window_begin_ns: now_ns,
            ..Default::default()
        };
    }

    pub fn add_lost(&mut self, buffer_name: &str, count: u64) {
        self.lost_count += count;
        *self
            .lost_count_per_buffer
            .entry(buffer_name.to_string())
            .or_default() += count;
    }

    /// Log per-second rates and reset if the window has elapsed.
    pub fn log_if_window_elapsed(&mut self, now_ns: u64) {
        if self.window_begin_ns + EVENT_COUNT_WINDOW_S * 1_000_000_000 >= now_ns {
            return;
        }
        let window_s = (now_ns - self.window_begin_ns) as f64 / 1e9;
        info!("Events per second (last {window_s:.1} s):");
        info!("  sched switches: {:.0}", self.sched_switch_count as f64 / window_s);
        info!("  samples: {:.0}", self.sample_count as f64 / window_s);
        info!("  u(ret)probes: {:.0}", self.uprobes_count as f64 / window_s);
        info!("  gpu events: {:.0}", self.gpu_events_count as f64 / window_s);
        info!("  lost: {:.0}, of which:", self.lost_count as f64 / window_s);
        for (buffer_name, lost) in &self.lost_count_per_buffer {
            info!("    from {}: {:.0}", buffer_name, *lost as f64 / window_s);
        }
        self.reset(now_ns);
    }
}
