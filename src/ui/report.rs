//! Human-readable reports: per-call-site cost rankings with backtraces.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::io::{self, Write};

use log::warn;

use crate::analyze::data::TraceData;
use crate::core::types::{
    Allocation, AllocationData, CostKind, InstructionPointer, IpIndex, TraceIndex,
};

/// Byte counts formatted the way the reports print them: plain below 1000,
/// otherwise scaled with two decimals.
pub struct FormatBytes(pub i64);

impl fmt::Display for FormatBytes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.0 < 0 {
            return write!(f, "-{}", FormatBytes(self.0.saturating_neg()));
        }
        if self.0 < 1000 {
            return write!(f, "{}B", self.0);
        }
        const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
        let mut unit = 0;
        let mut bytes = self.0 as f64;
        while unit < UNITS.len() - 1 && bytes > 1000.0 {
            bytes /= 1000.0;
            unit += 1;
        }
        write!(f, "{:.2}{}", bytes, UNITS[unit])
    }
}

/// Shortens template argument lists to `<>`, leaving comparison and shift
/// operator names intact.
pub fn pretty_function(function: &str, shorten_templates: bool) -> String {
    if !shorten_templates {
        return function.to_owned();
    }
    let mut ret = String::with_capacity(function.len());
    let mut depth = 0i32;
    for c in function.chars() {
        if c == '<' || c == '>' {
            let op = if ret.ends_with(c) {
                if c == '<' {
                    "operator<"
                } else {
                    "operator>"
                }
            } else {
                "operator"
            };
            if ret.ends_with(op) {
                ret.push(c);
                continue;
            }
        }
        if c == '<' {
            depth += 1;
            if depth == 1 {
                ret.push(c);
            }
        } else if c == '>' {
            depth -= 1;
            if depth == 0 {
                ret.push(c);
            }
        } else if depth == 0 {
            ret.push(c);
        }
    }
    ret
}

#[derive(Debug, Clone, Copy)]
pub struct ReportOptions {
    pub shorten_templates: bool,
    pub merge_backtraces: bool,
    pub peak_limit: usize,
    pub sub_peak_limit: usize,
}

impl Default for ReportOptions {
    fn default() -> ReportOptions {
        ReportOptions {
            shorten_templates: true,
            merge_backtraces: true,
            peak_limit: 10,
            sub_peak_limit: 5,
        }
    }
}

/// Allocations merged by call site: every bucket groups backtraces whose
/// top instruction pointer is the same function, ignoring the raw address.
#[derive(Debug, Default, Clone)]
pub struct MergedAllocation {
    pub ip_index: IpIndex,
    pub data: AllocationData,
    pub traces: Vec<Allocation>,
}

pub fn merge_allocations(data: &TraceData, allocations: &[Allocation]) -> Vec<MergedAllocation> {
    let mut merged: Vec<MergedAllocation> = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        if !allocation.trace_index.is_valid() {
            continue;
        }
        let trace = data.find_trace(allocation.trace_index);
        let trace_ip = data.find_ip(trace.ip_index);
        let pos = merged.partition_point(|bucket| {
            data.find_ip(bucket.ip_index).cmp_without_address(&trace_ip) == Ordering::Less
        });
        let bucket_matches = merged
            .get(pos)
            .map(|bucket| data.find_ip(bucket.ip_index).equal_without_address(&trace_ip))
            .unwrap_or(false);
        if !bucket_matches {
            merged.insert(
                pos,
                MergedAllocation {
                    ip_index: trace.ip_index,
                    data: AllocationData::default(),
                    traces: Vec::new(),
                },
            );
        }
        merged[pos].traces.push(*allocation);
    }

    for bucket in &mut merged {
        let mut sum = AllocationData::default();
        for trace in &bucket.traces {
            sum += trace.data;
        }
        bucket.data = sum;
    }
    merged
}

/// Drops allocations whose backtrace, up to the stop frame, never mentions
/// `function` (inlined frames included).
pub fn filter_by_function(data: &TraceData, allocations: &mut Vec<Allocation>, function: &str) {
    allocations.retain(|allocation| backtrace_contains(data, allocation.trace_index, function));
}

fn backtrace_contains(data: &TraceData, trace_index: TraceIndex, function: &str) -> bool {
    let mut guard = HashSet::new();
    let mut node = data.find_trace(trace_index);
    let mut index = trace_index;
    while node.ip_index.is_valid() && guard.insert(index) {
        let ip = data.find_ip(node.ip_index);
        if data.is_stop_index(ip.frame.function) {
            break;
        }
        let mut frames = std::iter::once(ip.frame.function).chain(
            ip.inlined.iter().map(|frame| frame.function),
        );
        if frames.any(|f| data.string(f).contains(function)) {
            return true;
        }
        index = node.parent_index;
        node = data.find_trace(index);
    }
    false
}

pub type LabelFn<'a> = &'a dyn Fn(&mut dyn Write, &AllocationData) -> io::Result<()>;

/// Ranked report over the (already filtered) allocation list.
pub struct Reporter<'a> {
    data: &'a TraceData,
    options: ReportOptions,
    allocations: Vec<Allocation>,
    merged: Vec<MergedAllocation>,
}

impl<'a> Reporter<'a> {
    pub fn new(
        data: &'a TraceData,
        options: ReportOptions,
        filter_bt_function: Option<&str>,
    ) -> Reporter<'a> {
        let mut allocations: Vec<Allocation> = data
            .allocations
            .iter()
            .filter(|allocation| !data.is_suppressed(allocation.trace_index))
            .copied()
            .collect();
        if let Some(function) = filter_bt_function {
            if !function.is_empty() {
                filter_by_function(data, &mut allocations, function);
            }
        }
        let merged = merge_allocations(data, &allocations);
        Reporter {
            data,
            options,
            allocations,
            merged,
        }
    }

    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    /// Prints the top entries for one cost metric, merged by call site or
    /// per backtrace depending on the options.
    pub fn print_allocations(
        &mut self,
        w: &mut dyn Write,
        cost: CostKind,
        label: LabelFn,
        sublabel: LabelFn,
    ) -> io::Result<()> {
        if self.options.merge_backtraces {
            self.print_merged(w, cost, label, sublabel)
        } else {
            self.print_unmerged(w, cost, label)
        }
    }

    fn print_merged(
        &mut self,
        w: &mut dyn Write,
        cost: CostKind,
        label: LabelFn,
        sublabel: LabelFn,
    ) -> io::Result<()> {
        let data = self.data;
        let options = self.options;
        self.merged
            .sort_by(|l, r| cost.of(&r.data).abs().cmp(&cost.of(&l.data).abs()));

        for bucket in self.merged.iter_mut().take(options.peak_limit) {
            if cost.of(&bucket.data) == 0 {
                break;
            }
            label(w, &bucket.data)?;
            print_ip(data, &options, w, &data.find_ip(bucket.ip_index), 0)?;

            bucket
                .traces
                .sort_by(|l, r| cost.of(&r.data).abs().cmp(&cost.of(&l.data).abs()));
            let mut handled = 0;
            for trace in bucket.traces.iter().take(options.sub_peak_limit) {
                if cost.of(&trace.data) == 0 {
                    break;
                }
                sublabel(w, &trace.data)?;
                handled += cost.of(&trace.data);
                print_backtrace(data, &options, w, trace.trace_index, 2, true)?;
            }
            if bucket.traces.len() > options.sub_peak_limit {
                let rest = cost.of(&bucket.data) - handled;
                write!(w, "  and ")?;
                if cost.is_count() {
                    write!(w, "{}", rest)?;
                } else {
                    write!(w, "{}", FormatBytes(rest))?;
                }
                writeln!(
                    w,
                    " from {} other places",
                    bucket.traces.len() - options.sub_peak_limit
                )?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    fn print_unmerged(
        &mut self,
        w: &mut dyn Write,
        cost: CostKind,
        label: LabelFn,
    ) -> io::Result<()> {
        let data = self.data;
        let options = self.options;
        self.allocations
            .sort_by(|l, r| cost.of(&r.data).abs().cmp(&cost.of(&l.data).abs()));
        for allocation in self.allocations.iter().take(options.peak_limit) {
            if cost.of(&allocation.data) == 0 {
                break;
            }
            label(w, &allocation.data)?;
            print_backtrace(data, &options, w, allocation.trace_index, 1, false)?;
            writeln!(w)?;
        }
        writeln!(w)?;
        Ok(())
    }
}

fn print_indent(w: &mut dyn Write, indent: usize, step: &str) -> io::Result<()> {
    for _ in 0..indent {
        write!(w, "{}", step)?;
    }
    Ok(())
}

/// Prints one resolved frame: function, `at file:line`, `in module`, then
/// any inlined frames.
pub fn print_ip(
    data: &TraceData,
    options: &ReportOptions,
    w: &mut dyn Write,
    ip: &InstructionPointer,
    indent: usize,
) -> io::Result<()> {
    print_indent(w, indent, "  ")?;
    if ip.frame.function.is_valid() {
        write!(
            w,
            "{}",
            pretty_function(data.string(ip.frame.function), options.shorten_templates)
        )?;
    } else {
        write!(w, "0x{:x}", ip.instruction_pointer)?;
    }
    writeln!(w)?;
    print_indent(w, indent + 1, "  ")?;

    if ip.frame.file.is_valid() {
        writeln!(w, "at {}:{}", data.string(ip.frame.file), ip.frame.line)?;
        print_indent(w, indent + 1, "  ")?;
    }

    if ip.module.is_valid() {
        writeln!(w, "in {}", data.string(ip.module))?;
    } else {
        writeln!(w, "in ??")?;
    }

    for inlined in &ip.inlined {
        print_indent(w, indent, "  ")?;
        writeln!(
            w,
            "{}",
            pretty_function(data.string(inlined.function), options.shorten_templates)
        )?;
        print_indent(w, indent + 1, "  ")?;
        writeln!(w, "at {}:{}", data.string(inlined.file), inlined.line)?;
    }
    Ok(())
}

/// Walks the parent links up to the stop frame. A visited set guards
/// against reference cycles in corrupt files.
pub fn print_backtrace(
    data: &TraceData,
    options: &ReportOptions,
    w: &mut dyn Write,
    trace_index: TraceIndex,
    indent: usize,
    skip_first: bool,
) -> io::Result<()> {
    if !trace_index.is_valid() {
        write!(w, "  ??")?;
        return Ok(());
    }

    let mut guard = HashSet::new();
    guard.insert(trace_index);
    let mut node = data.find_trace(trace_index);
    let mut skip = skip_first;
    while node.ip_index.is_valid() {
        let ip = data.find_ip(node.ip_index);
        if !skip {
            print_ip(data, options, w, &ip, indent)?;
        }
        skip = false;

        if data.is_stop_index(ip.frame.function) {
            break;
        }
        if !guard.insert(node.parent_index) {
            warn!("trace recursion detected - corrupt data file?");
            break;
        }
        node = data.find_trace(node.parent_index);
    }
    Ok(())
}

/// The closing summary block.
pub fn print_summary(data: &TraceData, w: &mut dyn Write) -> io::Result<()> {
    let total_time_s = 0.001 * data.total_time as f64;
    writeln!(w, "total runtime: {:.2}s.", total_time_s)?;
    writeln!(
        w,
        "calls to allocation functions: {} ({}/s)",
        data.total_cost.allocations,
        (data.total_cost.allocations as f64 / total_time_s) as i64
    )?;
    writeln!(
        w,
        "temporary memory allocations: {} ({}/s)",
        data.total_cost.temporary,
        (data.total_cost.temporary as f64 / total_time_s) as i64
    )?;
    writeln!(
        w,
        "peak heap memory consumption: {}",
        FormatBytes(data.total_cost.peak)
    )?;
    writeln!(
        w,
        "peak RSS (including profiler overhead): {}",
        FormatBytes((data.peak_rss * data.system_info.page_size) as i64)
    )?;
    writeln!(w, "total memory leaked: {}", FormatBytes(data.total_cost.leaked))?;
    if data.total_leaked_suppressed() > 0 {
        writeln!(
            w,
            "suppressed leaks: {}",
            FormatBytes(data.total_leaked_suppressed())
        )?;
    }
    Ok(())
}

/// Lists every suppression that matched, with its tallies.
pub fn print_suppressions(data: &TraceData, w: &mut dyn Write) -> io::Result<()> {
    if data.suppressions.iter().all(|s| s.matches == 0) {
        return Ok(());
    }
    writeln!(w, "Suppressions used:")?;
    writeln!(w, "  matches    leaked  pattern")?;
    for suppression in &data.suppressions {
        if suppression.matches == 0 {
            continue;
        }
        writeln!(
            w,
            "  {:>7} {:>9} {}",
            suppression.matches,
            FormatBytes(suppression.leaked).to_string(),
            suppression.pattern
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::data::{NullSink, TraceData};
    use std::io::Cursor;

    fn read(input: &str) -> TraceData {
        let mut data = TraceData::new();
        let mut cursor = Cursor::new(input.as_bytes().to_vec());
        data.read(&mut cursor, &mut NullSink).expect("stream must parse");
        data.finalize();
        data
    }

    /// Three call sites below main: two leaky ones in the same function at
    /// different addresses (mergeable), one temporary-heavy one.
    fn sample() -> TraceData {
        read(
            "s app\ns main\ns alloc_a\ns a.c\ns alloc_b\ns b.c\n\
             i 100 1 2 0 0\n\
             i 200 1 3 4 a\n\
             i 201 1 3 4 a\n\
             i 300 1 5 6 14\n\
             t 100 0\nt 200 1\nt 201 1\nt 300 1\n\
             + 100 2 a0\n+ 200 3 b0\n+ 10 4 c0\n- c0\n+ 10 4 d0\n- d0\n",
        )
    }

    #[test]
    fn format_bytes() {
        assert_eq!(FormatBytes(0).to_string(), "0B");
        assert_eq!(FormatBytes(999).to_string(), "999B");
        assert_eq!(FormatBytes(1234).to_string(), "1.23KB");
        assert_eq!(FormatBytes(2_560_000).to_string(), "2.56MB");
        assert_eq!(FormatBytes(3_000_000_000).to_string(), "3.00GB");
        assert_eq!(FormatBytes(-1234).to_string(), "-1.23KB");
    }

    #[test]
    fn pretty_function_shortens_templates() {
        assert_eq!(
            pretty_function("std::vector<int, std::allocator<int>>::push_back", true),
            "std::vector<>::push_back"
        );
        assert_eq!(
            pretty_function("std::vector<int>::push_back", false),
            "std::vector<int>::push_back"
        );
        assert_eq!(pretty_function("plain_c_function", true), "plain_c_function");
    }

    #[test]
    fn pretty_function_keeps_operators() {
        assert_eq!(pretty_function("Foo::operator<", true), "Foo::operator<");
        assert_eq!(pretty_function("Foo::operator<<", true), "Foo::operator<<");
        assert_eq!(pretty_function("Foo::operator>>", true), "Foo::operator>>");
        assert_eq!(
            pretty_function("Bar<int>::operator<<", true),
            "Bar<>::operator<<"
        );
    }

    #[test]
    fn merging_groups_by_function_not_address() {
        let data = sample();
        let merged = merge_allocations(&data, &data.allocations);
        // alloc_a at 0x200 and 0x201 collapse into one bucket
        assert_eq!(merged.len(), 2);
        let a = merged
            .iter()
            .find(|m| data.string(data.find_ip(m.ip_index).frame.function) == "alloc_a")
            .unwrap();
        assert_eq!(a.traces.len(), 2);
        assert_eq!(a.data.leaked, 0x300);
        assert_eq!(a.data.allocations, 2);
    }

    #[test]
    fn merging_is_permutation_invariant() {
        let data = sample();
        let forward = data.allocations.clone();
        let mut backward = data.allocations.clone();
        backward.reverse();

        let merge_and_sort = |allocations: &[Allocation]| {
            let mut merged = merge_allocations(&data, allocations);
            merged.sort_by(|l, r| r.data.leaked.abs().cmp(&l.data.leaked.abs()));
            merged
                .iter()
                .map(|m| (m.ip_index, m.data))
                .collect::<Vec<_>>()
        };
        assert_eq!(merge_and_sort(&forward), merge_and_sort(&backward));
    }

    #[test]
    fn backtrace_printing_stops_at_main() {
        let data = sample();
        let options = ReportOptions::default();
        let mut out = Vec::new();
        print_backtrace(&data, &options, &mut out, TraceIndex(2), 0, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("alloc_a"));
        assert!(text.contains("at a.c:10"));
        assert!(text.contains("in app"));
        assert!(text.contains("main"));
        // nothing below main is printed and main terminates the walk
        assert_eq!(text.matches("main").count(), 1);
    }

    #[test]
    fn unresolved_frames_print_raw_addresses() {
        let data = read("t badc0de 0\n+ 10 1 50\n");
        let options = ReportOptions::default();
        let mut out = Vec::new();
        print_backtrace(&data, &options, &mut out, TraceIndex(1), 0, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("0xbadc0de"));
        assert!(text.contains("in ??"));
    }

    #[test]
    fn merged_report_lists_remainder() {
        let data = sample();
        let mut reporter = Reporter::new(
            &data,
            ReportOptions {
                sub_peak_limit: 1,
                ..ReportOptions::default()
            },
            None,
        );
        let mut out = Vec::new();
        reporter
            .print_allocations(
                &mut out,
                CostKind::Leaked,
                &|w, d| writeln!(w, "{} leaked from", FormatBytes(d.leaked)),
                &|w, d| writeln!(w, "{} leaked from:", FormatBytes(d.leaked)),
            )
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("768B leaked from"));
        assert!(text.contains("and 256B from 1 other places"));
    }

    #[test]
    fn filter_by_backtrace_function() {
        let data = sample();
        let reporter = Reporter::new(&data, ReportOptions::default(), Some("alloc_b"));
        assert_eq!(reporter.allocations().len(), 1);
        let kept = reporter.allocations()[0];
        let ip = data.find_ip(data.find_trace(kept.trace_index).ip_index);
        assert_eq!(data.string(ip.frame.function), "alloc_b");
        // the stop frame itself never matches
        let none = Reporter::new(&data, ReportOptions::default(), Some("main"));
        assert!(none.allocations().is_empty());
    }

    #[test]
    fn summary_block() {
        let data = read("t 1 0\n+ 400 1 a0\nc 3e8\nR 2\nI 1000 8\n");
        let mut out = Vec::new();
        print_summary(&data, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("total runtime: 1.00s."));
        assert!(text.contains("calls to allocation functions: 1 (1/s)"));
        assert!(text.contains("peak heap memory consumption: 1.02KB"));
        // 2 pages of 0x1000 bytes
        assert!(text.contains("peak RSS (including profiler overhead): 8.19KB"));
        assert!(text.contains("total memory leaked: 1.02KB"));
    }
}
