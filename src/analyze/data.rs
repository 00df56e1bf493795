//! The accumulated trace data: ingests the event stream, interns strings,
//! instruction pointers and traces, and folds allocation events into the
//! per-trace cost model.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use anyhow::Context as _;
use flate2::bufread::MultiGzDecoder;
use log::{debug, warn};

use crate::analyze::suppressions::{matches_suppression, Suppression};
use crate::core::reader::{LineReader, ReadError};
use crate::core::strings::Interner;
use crate::core::types::{
    Allocation, AllocationData, AllocationIndex, AllocationInfo, Frame, InstructionPointer,
    IpIndex, StringIndex, SystemInfo, TraceIndex, TraceNode,
};
use crate::symbolize::demangle::Demangler;
use crate::symbolize::dwarf::RawFrame;
use crate::symbolize::modules::ModuleRegistry;

/// Function names at which backtrace printing stops; everything below is
/// startup machinery.
pub const STOP_FUNCTIONS: [&str; 3] = [
    "main",
    "_GLOBAL__sub_I_main",
    "__static_initialization_and_destruction_0",
];

/// Hooks fired while the stream is consumed. The report engine uses them to
/// drive the massif export and the size histogram; the diff reader plugs in
/// [`NullSink`].
pub trait EventSink {
    fn on_allocation(&mut self, _data: &TraceData, _info: AllocationInfo, _index: AllocationIndex) {
    }
    /// `is_last` is set for the one synthetic tick fired at end of file.
    fn on_timestamp(&mut self, _data: &TraceData, _old_ms: u64, _new_ms: u64, _is_last: bool) {}
    fn on_debuggee(&mut self, _data: &TraceData, _command: &str) {}
}

pub struct NullSink;

impl EventSink for NullSink {}

pub struct TraceData {
    pub strings: Interner,
    pub instruction_pointers: Vec<InstructionPointer>,
    ip_map: HashMap<u64, IpIndex>,
    pub traces: Vec<TraceNode>,
    trace_map: HashMap<(IpIndex, TraceIndex), TraceIndex>,
    pub allocations: Vec<Allocation>,
    allocation_by_trace: HashMap<TraceIndex, usize>,
    pub allocation_infos: Vec<AllocationInfo>,
    allocation_info_map: HashMap<AllocationInfo, AllocationIndex>,
    /// Live pointers during ingestion.
    active_allocations: HashMap<u64, AllocationIndex>,
    last_allocation: Option<(u64, TraceIndex)>,
    pub total_cost: AllocationData,
    /// Total runtime in ms, at least 1; fixed up at end of file.
    pub total_time: u64,
    timestamp: u64,
    /// Peak resident set size in pages.
    pub peak_rss: u64,
    pub system_info: SystemInfo,
    pub debuggee_command: Option<String>,
    pub suppressions: Vec<Suppression>,
    suppressed_traces: HashMap<TraceIndex, Option<usize>>,
    pub registry: ModuleRegistry,
    demangler: Demangler,
}

impl Default for TraceData {
    fn default() -> TraceData {
        TraceData::new()
    }
}

impl TraceData {
    pub fn new() -> TraceData {
        TraceData::with_suppressions(Vec::new())
    }

    pub fn with_suppressions(suppressions: Vec<Suppression>) -> TraceData {
        TraceData {
            strings: Interner::new(),
            instruction_pointers: Vec::new(),
            ip_map: HashMap::new(),
            traces: Vec::new(),
            trace_map: HashMap::new(),
            allocations: Vec::new(),
            allocation_by_trace: HashMap::new(),
            allocation_infos: Vec::new(),
            allocation_info_map: HashMap::new(),
            active_allocations: HashMap::new(),
            last_allocation: None,
            total_cost: AllocationData::default(),
            total_time: 1,
            timestamp: 0,
            peak_rss: 0,
            system_info: SystemInfo::default(),
            debuggee_command: None,
            suppressions,
            suppressed_traces: HashMap::new(),
            registry: ModuleRegistry::new(),
            demangler: Demangler::new(),
        }
    }

    /// Consumes the event stream to end of file. Any malformed record
    /// aborts with an error naming the offending line.
    pub fn read<R: BufRead>(
        &mut self,
        input: &mut R,
        sink: &mut dyn EventSink,
    ) -> Result<(), ReadError> {
        let mut reader = LineReader::new();
        while reader.next_line(input)? {
            match reader.mode() {
                's' => {
                    self.strings.add(reader.rest());
                }
                'm' => {
                    let file_name = reader.read_token().map(str::to_owned);
                    let Some(file_name) = file_name else {
                        return Err(reader.malformed());
                    };
                    if file_name == "-" {
                        self.registry.clear_modules();
                    } else {
                        let is_exe = reader.read_hex().ok_or_else(|| reader.malformed())? != 0;
                        let start = reader.read_hex().ok_or_else(|| reader.malformed())?;
                        let end = reader.read_hex().ok_or_else(|| reader.malformed())?;
                        self.registry.add_module(&file_name, is_exe, start, end);
                    }
                }
                'i' => {
                    let raw = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let module = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let mut ip = InstructionPointer {
                        instruction_pointer: raw,
                        module: StringIndex(module as u32),
                        ..Default::default()
                    };
                    if let Some(function) = reader.read_hex() {
                        ip.frame.function = StringIndex(function as u32);
                        if let Some(file) = reader.read_hex() {
                            ip.frame.file = StringIndex(file as u32);
                            ip.frame.line =
                                reader.read_hex().ok_or_else(|| reader.malformed())? as i32;
                            while let Some(inlined_function) = reader.read_hex() {
                                let file =
                                    reader.read_hex().ok_or_else(|| reader.malformed())?;
                                let line =
                                    reader.read_hex().ok_or_else(|| reader.malformed())?;
                                ip.inlined.push(Frame {
                                    function: StringIndex(inlined_function as u32),
                                    file: StringIndex(file as u32),
                                    line: line as i32,
                                });
                            }
                        }
                    }
                    self.add_ip(ip);
                }
                't' => {
                    let raw_ip = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let parent = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let ip_index = self.intern_ip(raw_ip);
                    self.intern_trace(ip_index, TraceIndex(parent as u32));
                }
                '+' => {
                    let size = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let trace = TraceIndex(
                        reader.read_hex().ok_or_else(|| reader.malformed())? as u32
                    );
                    let ptr = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    self.handle_allocation(size, trace, ptr, sink);
                }
                '-' => {
                    let ptr = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    self.handle_deallocation(ptr);
                }
                'c' => {
                    let stamp = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let old = self.timestamp;
                    self.timestamp = stamp;
                    sink.on_timestamp(self, old, stamp, false);
                }
                'R' => {
                    let rss = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    self.peak_rss = self.peak_rss.max(rss);
                }
                'I' => {
                    let page_size = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    let pages = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    self.system_info = SystemInfo { page_size, pages };
                }
                'X' => {
                    let command = reader.rest().to_owned();
                    sink.on_debuggee(self, &command);
                    self.debuggee_command = Some(command);
                }
                _ => {
                    debug!("skipping unsupported record: {}", reader.line());
                }
            }
        }

        let old = self.timestamp;
        self.total_time = self.timestamp.max(1);
        sink.on_timestamp(self, old, self.total_time, true);
        Ok(())
    }

    fn handle_allocation(
        &mut self,
        size: u64,
        trace: TraceIndex,
        ptr: u64,
        sink: &mut dyn EventSink,
    ) {
        let info = AllocationInfo {
            size,
            trace_index: trace,
        };
        let index = match self.allocation_info_map.get(&info) {
            Some(&index) => index,
            None => {
                let index = AllocationIndex(self.allocation_infos.len() as u32 + 1);
                self.allocation_infos.push(info);
                self.allocation_info_map.insert(info, index);
                index
            }
        };

        if self.active_allocations.insert(ptr, index).is_some() {
            debug!("pointer {:x} is already live, overwriting", ptr);
        }
        self.last_allocation = Some((ptr, trace));

        let size = size as i64;
        let entry = self.allocation_mut(trace);
        entry.data.allocations += 1;
        entry.data.leaked += size;
        entry.data.peak = entry.data.peak.max(entry.data.leaked);

        self.total_cost.allocations += 1;
        self.total_cost.leaked += size;
        self.total_cost.peak = self.total_cost.peak.max(self.total_cost.leaked);

        if let Some(suppression) = self.suppression_for_trace(trace) {
            self.suppressions[suppression].matches += 1;
        }

        sink.on_allocation(self, info, index);
    }

    fn handle_deallocation(&mut self, ptr: u64) {
        // freeing a pointer we never saw allocated is a no-op
        let Some(index) = self.active_allocations.remove(&ptr) else {
            return;
        };
        let Some(&info) = self.allocation_infos.get(index.0 as usize - 1) else {
            return;
        };

        let temporary = self.last_allocation == Some((ptr, info.trace_index));
        self.last_allocation = None;

        let size = info.size as i64;
        let entry = self.allocation_mut(info.trace_index);
        entry.data.leaked -= size;
        if temporary {
            entry.data.temporary += 1;
        }
        self.total_cost.leaked -= size;
        if temporary {
            self.total_cost.temporary += 1;
        }
    }

    /// Looks up or creates the instruction pointer record for a raw
    /// address, symbolizing through the module registry on first sight.
    pub fn intern_ip(&mut self, raw: u64) -> IpIndex {
        if raw == 0 {
            return IpIndex(0);
        }
        if let Some(&index) = self.ip_map.get(&raw) {
            return index;
        }

        let mut ip = InstructionPointer {
            instruction_pointer: raw,
            ..Default::default()
        };
        if let Some(resolved) = self.registry.resolve_ip(raw, &self.demangler) {
            ip.module = self.strings.intern(&resolved.module);
            if let Some(frames) = resolved.frames {
                ip.frame = self.intern_frame(&frames.frame);
                ip.inlined = frames.inlined.iter().map(|f| self.intern_frame(f)).collect();
            }
        }
        self.add_ip(ip)
    }

    fn add_ip(&mut self, ip: InstructionPointer) -> IpIndex {
        let index = IpIndex(self.instruction_pointers.len() as u32 + 1);
        self.ip_map.entry(ip.instruction_pointer).or_insert(index);
        self.instruction_pointers.push(ip);
        index
    }

    fn intern_frame(&mut self, raw: &RawFrame) -> Frame {
        Frame {
            function: self.strings.intern(&raw.function),
            file: self.strings.intern(&raw.file),
            line: raw.line,
        }
    }

    /// Allocates a new trace node when `(ip, parent)` is novel.
    pub fn intern_trace(&mut self, ip: IpIndex, parent: TraceIndex) -> TraceIndex {
        if let Some(&index) = self.trace_map.get(&(ip, parent)) {
            return index;
        }
        let index = TraceIndex(self.traces.len() as u32 + 1);
        self.traces.push(TraceNode {
            ip_index: ip,
            parent_index: parent,
        });
        self.trace_map.insert((ip, parent), index);
        index
    }

    pub fn find_trace(&self, index: TraceIndex) -> TraceNode {
        if !index.is_valid() {
            return TraceNode::default();
        }
        match self.traces.get(index.0 as usize - 1) {
            Some(&node) => node,
            None => {
                warn!("invalid trace index: {}", index);
                TraceNode::default()
            }
        }
    }

    pub fn find_ip(&self, index: IpIndex) -> InstructionPointer {
        if !index.is_valid() {
            return InstructionPointer::default();
        }
        match self.instruction_pointers.get(index.0 as usize - 1) {
            Some(ip) => ip.clone(),
            None => {
                warn!("invalid instruction pointer index: {}", index);
                InstructionPointer::default()
            }
        }
    }

    pub fn string(&self, index: StringIndex) -> &str {
        self.strings.get(index)
    }

    pub fn is_stop_index(&self, function: StringIndex) -> bool {
        function.is_valid() && STOP_FUNCTIONS.contains(&self.strings.get(function))
    }

    fn allocation_mut(&mut self, trace: TraceIndex) -> &mut Allocation {
        let index = match self.allocation_by_trace.get(&trace) {
            Some(&index) => index,
            None => {
                let index = self.allocations.len();
                self.allocations.push(Allocation {
                    trace_index: trace,
                    data: AllocationData::default(),
                });
                self.allocation_by_trace.insert(trace, index);
                index
            }
        };
        &mut self.allocations[index]
    }

    /// The first suppression matching any function on the trace's root
    /// path, cached per trace.
    fn suppression_for_trace(&mut self, trace: TraceIndex) -> Option<usize> {
        if self.suppressions.is_empty() {
            return None;
        }
        if let Some(&cached) = self.suppressed_traces.get(&trace) {
            return cached;
        }

        let mut result = None;
        let mut guard = HashSet::new();
        let mut node = trace;
        'walk: while node.is_valid() && guard.insert(node) {
            let trace_node = self.find_trace(node);
            let ip = self.find_ip(trace_node.ip_index);
            let functions = std::iter::once(ip.frame.function)
                .chain(ip.inlined.iter().map(|frame| frame.function));
            for function in functions {
                let name = self.strings.get(function);
                if name.is_empty() {
                    continue;
                }
                if let Some(index) = self
                    .suppressions
                    .iter()
                    .position(|s| matches_suppression(&s.pattern, name))
                {
                    result = Some(index);
                    break 'walk;
                }
            }
            node = trace_node.parent_index;
        }

        self.suppressed_traces.insert(trace, result);
        result
    }

    /// Whether the trace matched a suppression. Only meaningful after
    /// [`TraceData::finalize`].
    pub fn is_suppressed(&self, trace: TraceIndex) -> bool {
        matches!(self.suppressed_traces.get(&trace), Some(Some(_)))
    }

    /// Settles end-of-run accounting: outstanding leaks of suppressed
    /// traces flow into their suppression records.
    pub fn finalize(&mut self) {
        let costs: Vec<(TraceIndex, i64)> = self
            .allocations
            .iter()
            .map(|allocation| (allocation.trace_index, allocation.data.leaked))
            .collect();
        for (trace, leaked) in costs {
            if let Some(suppression) = self.suppression_for_trace(trace) {
                self.suppressions[suppression].leaked += leaked;
            }
        }
    }

    pub fn total_leaked_suppressed(&self) -> i64 {
        self.suppressions.iter().map(|s| s.leaked).sum()
    }

    /// Subtracts the per-trace costs of `base` from this data set. Traces
    /// are matched structurally across the two files; base traces without
    /// a counterpart are imported with negated costs.
    pub fn diff(&mut self, base: &TraceData) {
        self.total_cost -= base.total_cost;
        self.total_time = self.total_time.saturating_sub(base.total_time).max(1);
        self.peak_rss = self.peak_rss.saturating_sub(base.peak_rss);

        let mut base_costs: HashMap<String, (TraceIndex, AllocationData)> = HashMap::new();
        for allocation in &base.allocations {
            let key = base.trace_key(allocation.trace_index);
            base_costs
                .entry(key)
                .and_modify(|(_, data)| *data += allocation.data)
                .or_insert((allocation.trace_index, allocation.data));
        }

        let keys: Vec<String> = self
            .allocations
            .iter()
            .map(|allocation| self.trace_key(allocation.trace_index))
            .collect();
        for (index, key) in keys.iter().enumerate() {
            if let Some((_, data)) = base_costs.remove(key) {
                self.allocations[index].data -= data;
            }
        }

        let mut remaining: Vec<(String, (TraceIndex, AllocationData))> =
            base_costs.into_iter().collect();
        remaining.sort_by(|a, b| a.0.cmp(&b.0));

        let mut trace_cache = HashMap::new();
        let mut ip_cache = HashMap::new();
        for (_, (trace, data)) in remaining {
            let imported = self.import_trace(base, trace, &mut trace_cache, &mut ip_cache);
            let entry = self.allocation_mut(imported);
            entry.data -= data;
        }
    }

    /// A structural signature of the trace, comparable across data sets.
    fn trace_key(&self, trace: TraceIndex) -> String {
        let mut key = String::new();
        let mut guard = HashSet::new();
        let mut node = trace;
        while node.is_valid() && guard.insert(node) {
            let trace_node = self.find_trace(node);
            let ip = self.find_ip(trace_node.ip_index);
            self.push_frame_key(&mut key, ip.module, &ip.frame);
            for frame in &ip.inlined {
                self.push_frame_key(&mut key, ip.module, frame);
            }
            key.push('\x1e');
            node = trace_node.parent_index;
        }
        key
    }

    fn push_frame_key(&self, key: &mut String, module: StringIndex, frame: &Frame) {
        key.push_str(self.strings.get(module));
        key.push('\x1f');
        key.push_str(self.strings.get(frame.function));
        key.push('\x1f');
        key.push_str(self.strings.get(frame.file));
        key.push('\x1f');
        key.push_str(&frame.line.to_string());
        key.push('\x1f');
    }

    fn import_trace(
        &mut self,
        base: &TraceData,
        trace: TraceIndex,
        trace_cache: &mut HashMap<TraceIndex, TraceIndex>,
        ip_cache: &mut HashMap<IpIndex, IpIndex>,
    ) -> TraceIndex {
        if !trace.is_valid() {
            return TraceIndex(0);
        }
        if let Some(&imported) = trace_cache.get(&trace) {
            return imported;
        }
        let node = base.find_trace(trace);
        let parent = self.import_trace(base, node.parent_index, trace_cache, ip_cache);
        let ip = self.import_ip(base, node.ip_index, ip_cache);
        let imported = self.intern_trace(ip, parent);
        trace_cache.insert(trace, imported);
        imported
    }

    fn import_ip(
        &mut self,
        base: &TraceData,
        ip: IpIndex,
        ip_cache: &mut HashMap<IpIndex, IpIndex>,
    ) -> IpIndex {
        if !ip.is_valid() {
            return IpIndex(0);
        }
        if let Some(&imported) = ip_cache.get(&ip) {
            return imported;
        }
        let base_ip = base.find_ip(ip);
        let converted = InstructionPointer {
            instruction_pointer: base_ip.instruction_pointer,
            module: self.strings.intern(base.strings.get(base_ip.module)),
            frame: self.convert_frame(base, &base_ip.frame),
            inlined: base_ip
                .inlined
                .iter()
                .map(|frame| self.convert_frame(base, frame))
                .collect(),
        };
        let imported = self.add_ip(converted);
        ip_cache.insert(ip, imported);
        imported
    }

    fn convert_frame(&mut self, base: &TraceData, frame: &Frame) -> Frame {
        Frame {
            function: self.strings.intern(base.strings.get(frame.function)),
            file: self.strings.intern(base.strings.get(frame.file)),
            line: frame.line,
        }
    }
}

/// Reads one profile data file, transparently decoding gzip.
pub fn read_file(
    path: &Path,
    suppressions: Vec<Suppression>,
    sink: &mut dyn EventSink,
) -> anyhow::Result<TraceData> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let mut input = open_stream(file)?;
    let mut data = TraceData::with_suppressions(suppressions);
    data.read(&mut input, sink)
        .with_context(|| format!("failed to read {:?}", path))?;
    data.finalize();
    Ok(data)
}

fn open_stream(file: File) -> io::Result<Box<dyn BufRead + Send>> {
    let mut buffered = BufReader::new(file);
    let magic = buffered.fill_buf()?;
    if magic.starts_with(&[0x1f, 0x8b]) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(buffered))))
    } else {
        Ok(Box::new(buffered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::suppressions::builtin_suppressions;
    use std::io::Cursor;

    fn read(input: &str) -> TraceData {
        read_with_suppressions(input, Vec::new())
    }

    fn read_with_suppressions(input: &str, suppressions: Vec<Suppression>) -> TraceData {
        let mut data = TraceData::with_suppressions(suppressions);
        let mut cursor = Cursor::new(input.as_bytes().to_vec());
        data.read(&mut cursor, &mut NullSink).expect("stream must parse");
        data.finalize();
        data
    }

    #[test]
    fn empty_input_yields_zero_totals() {
        let data = read("");
        assert_eq!(data.total_cost, AllocationData::default());
        assert_eq!(data.total_time, 1);
        assert!(data.allocations.is_empty());
    }

    #[test]
    fn simple_leak() {
        let data = read("t 123 0\n+ 100 1 7f00\n");
        assert_eq!(data.total_cost.leaked, 0x100);
        assert_eq!(data.total_cost.allocations, 1);
        assert_eq!(data.total_cost.temporary, 0);
        assert_eq!(data.total_cost.peak, 0x100);
        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].data.leaked, 0x100);
    }

    #[test]
    fn temporary_allocation() {
        let data = read("t 123 0\n+ 10 1 a0\n- a0\n");
        assert_eq!(data.total_cost.temporary, 1);
        assert_eq!(data.total_cost.leaked, 0);
        assert_eq!(data.total_cost.peak, 0x10);
        assert_eq!(data.allocations[0].data.temporary, 1);
    }

    #[test]
    fn interleaved_free_is_not_temporary() {
        let data = read("t 1 0\nt 2 0\n+ 10 1 a0\n+ 10 2 b0\n- a0\n- b0\n");
        // a0's free is not the event directly after its allocation
        assert_eq!(data.total_cost.temporary, 1);
        assert_eq!(data.total_cost.leaked, 0);
    }

    #[test]
    fn unknown_pointer_free_is_a_noop() {
        let data = read("t 1 0\n+ 10 1 a0\n- dead\n");
        assert_eq!(data.total_cost.leaked, 0x10);
        assert_eq!(data.total_cost.allocations, 1);
    }

    #[test]
    fn realloc_same_pointer_counts_alloc_and_free() {
        let data = read("t 1 0\n+ 10 1 a0\n- a0\n+ 20 1 a0\n");
        assert_eq!(data.total_cost.allocations, 2);
        assert_eq!(data.total_cost.leaked, 0x20);
        assert_eq!(data.total_cost.temporary, 1);
    }

    #[test]
    fn peak_tracks_high_water_mark() {
        let data = read("t 1 0\n+ 100 1 a0\n+ 100 1 b0\n- a0\n+ 10 1 c0\n");
        assert_eq!(data.total_cost.peak, 0x200);
        assert_eq!(data.total_cost.leaked, 0x110);
        assert_eq!(data.allocations[0].data.peak, 0x200);
    }

    #[test]
    fn per_trace_leaks_sum_to_total() {
        let data = read(
            "t 1 0\nt 2 0\nt 3 2\n+ 100 1 a0\n+ 80 2 b0\n+ 8 3 c0\n- b0\n",
        );
        let sum: i64 = data.allocations.iter().map(|a| a.data.leaked).sum();
        assert_eq!(sum, data.total_cost.leaked);
        assert_eq!(data.total_cost.leaked, 0x108);
    }

    #[test]
    fn timestamps_and_rss() {
        let data = read("c 1f4\nR 20\nc 3e8\nR 10\n");
        assert_eq!(data.total_time, 0x3e8);
        assert_eq!(data.peak_rss, 0x20);
    }

    #[test]
    fn system_info_record() {
        let data = read("I 1000 8000\n");
        assert_eq!(data.system_info.page_size, 0x1000);
        assert_eq!(data.system_info.pages, 0x8000);
    }

    #[test]
    fn debuggee_command() {
        let data = read("X ./app --flag value\n");
        assert_eq!(data.debuggee_command.as_deref(), Some("./app --flag value"));
    }

    #[test]
    fn string_and_ip_records() {
        let data = read(
            "s libc.so\ns malloc\ns malloc.c\ni dead00 1 2 3 2a\nt dead00 0\n+ 10 1 50\n",
        );
        let ip = data.find_ip(IpIndex(1));
        assert_eq!(data.string(ip.module), "libc.so");
        assert_eq!(data.string(ip.frame.function), "malloc");
        assert_eq!(data.string(ip.frame.file), "malloc.c");
        assert_eq!(ip.frame.line, 0x2a);
        assert_eq!(ip.instruction_pointer, 0xdead00);
        // the trace record reuses the declared ip
        assert_eq!(data.find_trace(TraceIndex(1)).ip_index, IpIndex(1));
    }

    #[test]
    fn ip_record_with_inlined_frames() {
        let data = read("s m\ns f\ns file\ns inl\ns inlfile\ni 100 1 2 3 1 4 5 7\n");
        let ip = data.find_ip(IpIndex(1));
        assert_eq!(ip.inlined.len(), 1);
        assert_eq!(data.string(ip.inlined[0].function), "inl");
        assert_eq!(data.string(ip.inlined[0].file), "inlfile");
        assert_eq!(ip.inlined[0].line, 7);
    }

    #[test]
    fn unresolved_ips_keep_their_address() {
        let data = read("t badc0de 0\n+ 10 1 50\n");
        let ip = data.find_ip(data.find_trace(TraceIndex(1)).ip_index);
        assert_eq!(ip.instruction_pointer, 0xbadc0de);
        assert!(!ip.frame.function.is_valid());
        assert!(!ip.module.is_valid());
    }

    #[test]
    fn malformed_record_is_fatal() {
        let mut data = TraceData::new();
        let mut cursor = Cursor::new(b"+ 10\n".to_vec());
        match data.read(&mut cursor, &mut NullSink) {
            Err(ReadError::MalformedRecord(line)) => assert_eq!(line, "+ 10"),
            other => panic!("expected malformed record, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn trace_interning_dedups() {
        let mut data = TraceData::new();
        let ip = data.intern_ip(0x100);
        let a = data.intern_trace(ip, TraceIndex(0));
        let b = data.intern_trace(ip, TraceIndex(0));
        let c = data.intern_trace(ip, a);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(data.traces.len(), 2);
    }

    #[test]
    fn suppression_matching_and_accounting() {
        let data = read_with_suppressions(
            "s app\ns main\ns g_main_context_new\ns malloc\n\
             i 100 1 2 0 0\ni 200 1 3 0 0\ni 300 1 4 0 0\n\
             t 100 0\nt 200 1\nt 300 2\n\
             + 64 3 a0\n",
            builtin_suppressions(),
        );
        let suppression = data
            .suppressions
            .iter()
            .find(|s| s.pattern == "g_main_context_new")
            .unwrap();
        assert_eq!(suppression.matches, 1);
        assert_eq!(suppression.leaked, 0x64);
        // the allocation stays in the totals
        assert_eq!(data.total_cost.leaked, 0x64);
        assert!(data.is_suppressed(TraceIndex(3)));
    }

    #[test]
    fn diff_subtracts_matching_traces() {
        let stream = "s app\ns main\ni 100 1 2 0 0\nt 100 0\n+ 100 1 a0\n+ 20 1 b0\n";
        let mut data = read(stream);
        let base = read("s app\ns main\ni 100 1 2 0 0\nt 100 0\n+ 100 1 f0\n");
        data.diff(&base);
        assert_eq!(data.total_cost.leaked, 0x20);
        assert_eq!(data.total_cost.allocations, 1);
        assert_eq!(data.allocations.len(), 1);
        assert_eq!(data.allocations[0].data.leaked, 0x20);
    }

    #[test]
    fn diff_imports_unmatched_traces_negated() {
        let mut data = read("s app\ns main\ni 100 1 2 0 0\nt 100 0\n+ 10 1 a0\n");
        let base = read("s app\ns other\ni 900 1 2 0 0\nt 900 0\n+ 100 1 f0\n");
        data.diff(&base);
        assert_eq!(data.total_cost.leaked, 0x10 - 0x100);
        let negated = data
            .allocations
            .iter()
            .find(|a| a.data.leaked < 0)
            .expect("imported allocation");
        assert_eq!(negated.data.leaked, -0x100);
        assert_eq!(negated.data.allocations, -1);
        // the imported trace is printable
        let node = data.find_trace(negated.trace_index);
        let ip = data.find_ip(node.ip_index);
        assert_eq!(data.string(ip.frame.function), "other");
    }

    #[test]
    fn stop_index_matches_main_only_when_interned() {
        let data = read("s app\ns main\n");
        assert!(data.is_stop_index(StringIndex(2)));
        assert!(!data.is_stop_index(StringIndex(1)));
        assert!(!data.is_stop_index(StringIndex(0)));
    }

    #[test]
    fn gzip_input_is_detected() -> anyhow::Result<()> {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write as _;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"t 1 0\n+ 100 1 a0\n")?;
        let compressed = encoder.finish()?;

        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(&compressed)?;
        let data = read_file(file.path(), Vec::new(), &mut NullSink)?;
        assert_eq!(data.total_cost.leaked, 0x100);
        Ok(())
    }
}
