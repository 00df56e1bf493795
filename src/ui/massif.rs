//! Massif-compatible export: one snapshot per clock tick carrying the peak
//! heap size since the previous snapshot, with detailed heap trees at a
//! configurable frequency.

use std::io::{self, Write};

use log::warn;

use crate::analyze::data::TraceData;
use crate::core::types::{Allocation, IpIndex};
use crate::ui::report::merge_allocations;

pub struct MassifWriter<W: Write> {
    out: W,
    /// Percentage of the current peak below which children collapse into a
    /// synthetic entry.
    threshold_percent: f64,
    /// Every how many snapshots a detailed tree is written; 0 disables
    /// detailed trees.
    detailed_freq: u64,
    snapshot_id: u64,
    last_peak: u64,
    snapshot_allocations: Vec<Allocation>,
    broken: bool,
}

impl<W: Write> MassifWriter<W> {
    pub fn new(out: W, threshold_percent: f64, detailed_freq: u64) -> MassifWriter<W> {
        MassifWriter {
            out,
            threshold_percent,
            detailed_freq,
            snapshot_id: 0,
            last_peak: 0,
            snapshot_allocations: Vec::new(),
            broken: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write_header(&mut self, command: &str) {
        self.guarded(|writer| {
            writeln!(
                writer.out,
                "desc: heapscope\ncmd: {}\ntime_unit: s",
                command
            )
        });
    }

    /// Tracks the peak heap consumption since the last snapshot, keeping a
    /// copy of the per-trace costs at that moment.
    pub fn track_allocation(&mut self, data: &TraceData) {
        if data.total_cost.leaked > 0 && data.total_cost.leaked as u64 > self.last_peak {
            self.last_peak = data.total_cost.leaked as u64;
            self.snapshot_allocations = data.allocations.clone();
        }
    }

    pub fn write_snapshot(&mut self, data: &TraceData, timestamp_ms: u64, is_last: bool) {
        if self.last_peak == 0 {
            self.last_peak = data.total_cost.leaked.max(0) as u64;
            self.snapshot_allocations = data.allocations.clone();
        }

        let detailed = self.detailed_freq != 0
            && (is_last || self.snapshot_id % self.detailed_freq == 0);
        let last_peak = self.last_peak;
        let threshold = (last_peak as f64 * self.threshold_percent * 0.01) as u64;
        let snapshot_id = self.snapshot_id;
        let allocations = self.snapshot_allocations.clone();

        self.guarded(|writer| {
            writeln!(
                writer.out,
                "#-----------\nsnapshot={}\n#-----------\ntime={}\nmem_heap_B={}\nmem_heap_extra_B=0\nmem_stacks_B=0",
                snapshot_id,
                0.001 * timestamp_ms as f64,
                last_peak
            )?;
            if detailed {
                writeln!(writer.out, "heap_tree=detailed")?;
                writer.write_backtrace(data, allocations, last_peak, threshold, IpIndex(0), 0)?;
            } else {
                writeln!(writer.out, "heap_tree=empty")?;
            }
            Ok(())
        });

        self.snapshot_id += 1;
        self.last_peak = 0;
    }

    /// Writes one heap-tree level, sorted by leaked bytes descending.
    /// Below-threshold siblings collapse into a synthetic `n0` entry that
    /// is injected in sorted position.
    fn write_backtrace(
        &mut self,
        data: &TraceData,
        allocations: Vec<Allocation>,
        heap_size: u64,
        threshold: u64,
        location: IpIndex,
        depth: usize,
    ) -> io::Result<()> {
        let mut skipped_leaked: i64 = 0;
        let mut num_allocs = 0usize;
        let mut skipped = 0usize;

        let mut merged = merge_allocations(data, &allocations);
        merged.sort_by(|l, r| r.data.leaked.cmp(&l.data.leaked));

        let ip = data.find_ip(location);
        // anything below main is not part of the tree
        let should_stop = data.is_stop_index(ip.frame.function);
        if !should_stop {
            for bucket in &mut merged {
                if bucket.data.leaked < 0 {
                    // sorted, everything below is uninteresting for massif
                    break;
                }
                if bucket.data.leaked as u64 >= threshold {
                    num_allocs += 1;
                    // drop the first backtrace level, it is this node
                    for allocation in &mut bucket.traces {
                        allocation.trace_index =
                            data.find_trace(allocation.trace_index).parent_index;
                    }
                } else {
                    skipped += 1;
                    skipped_leaked += bucket.data.leaked;
                }
            }
        }

        indent(&mut self.out, depth)?;
        write!(
            self.out,
            "n{}: {}",
            num_allocs + usize::from(skipped > 0),
            heap_size
        )?;
        if depth == 0 {
            writeln!(
                self.out,
                " (heap allocation functions) malloc/new/new[], --alloc-fns, etc."
            )?;
        } else {
            write!(self.out, " 0x{:x}: ", ip.instruction_pointer)?;
            if ip.frame.function.is_valid() {
                write!(self.out, "{}", data.string(ip.frame.function))?;
            } else {
                write!(self.out, "???")?;
            }
            write!(self.out, " (")?;
            if ip.frame.file.is_valid() {
                write!(
                    self.out,
                    "{}:{}",
                    data.string(ip.frame.file),
                    ip.frame.line
                )?;
            } else if ip.module.is_valid() {
                write!(self.out, "{}", data.string(ip.module))?;
            } else {
                write!(self.out, "???")?;
            }
            writeln!(self.out, ")")?;
        }

        if !should_stop {
            let mut skipped_pending = skipped > 0;
            for bucket in &merged {
                if bucket.data.leaked > 0 && bucket.data.leaked as u64 >= threshold {
                    if skipped_pending && skipped_leaked > bucket.data.leaked {
                        self.write_skipped(depth, skipped_leaked, skipped)?;
                        skipped_pending = false;
                    }
                    self.write_backtrace(
                        data,
                        bucket.traces.clone(),
                        bucket.data.leaked as u64,
                        threshold,
                        bucket.ip_index,
                        depth + 1,
                    )?;
                }
            }
            if skipped_pending {
                self.write_skipped(depth, skipped_leaked, skipped)?;
            }
        }
        Ok(())
    }

    fn write_skipped(&mut self, depth: usize, leaked: i64, places: usize) -> io::Result<()> {
        indent(&mut self.out, depth)?;
        writeln!(
            self.out,
            " n0: {} in {} places, all below massif's threshold ({})",
            leaked, places, self.threshold_percent
        )
    }

    /// Runs one write step; a failing sink is disabled with one diagnostic
    /// while the rest of the run continues.
    fn guarded(&mut self, write: impl FnOnce(&mut Self) -> io::Result<()>) {
        if self.broken {
            return;
        }
        if let Err(err) = write(self) {
            warn!("massif output failed, disabling: {}", err);
            self.broken = true;
        }
    }
}

fn indent<W: Write>(w: &mut W, depth: usize) -> io::Result<()> {
    for _ in 0..depth {
        write!(w, " ")?;
    }
    Ok(())
}
