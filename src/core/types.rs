/// Core types used throughout heapscope: dense index handles, resolved
/// frames, trace nodes and the per-trace cost aggregates.
use std::cmp::Ordering;
use std::fmt;
use std::ops::{AddAssign, SubAssign};

/// 1-based handle into the string pool; 0 means "absent".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringIndex(pub u32);

/// 1-based handle into the instruction pointer table; 0 means "absent".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpIndex(pub u32);

/// 1-based handle into the trace node table; 0 is the empty trace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceIndex(pub u32);

/// 1-based handle into the allocation-info table; 0 means "absent".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationIndex(pub u32);

macro_rules! index_impls {
    ($($ty:ident),*) => {$(
        impl $ty {
            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )*};
}
index_impls!(StringIndex, IpIndex, TraceIndex, AllocationIndex);

/// One resolved source location: function, file and line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    pub function: StringIndex,
    pub file: StringIndex,
    pub line: i32,
}

/// An interned instruction pointer with its resolved frame and any frames
/// inlined into it, ordered outermost to innermost.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstructionPointer {
    pub instruction_pointer: u64,
    pub module: StringIndex,
    pub frame: Frame,
    pub inlined: Vec<Frame>,
}

impl InstructionPointer {
    /// Frames at different addresses often belong to the same function,
    /// especially without debug symbols. Merging compares everything but
    /// the raw address.
    pub fn equal_without_address(&self, other: &InstructionPointer) -> bool {
        self.cmp_without_address(other) == Ordering::Equal
    }

    pub fn cmp_without_address(&self, other: &InstructionPointer) -> Ordering {
        (self.module, self.frame, &self.inlined).cmp(&(other.module, other.frame, &other.inlined))
    }
}

/// One node of the parent-linked trace forest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraceNode {
    pub ip_index: IpIndex,
    pub parent_index: TraceIndex,
}

/// Cost aggregate tracked per trace and globally. Signed so that diff mode
/// can go negative.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocationData {
    /// Number of calls to allocation functions.
    pub allocations: i64,
    /// Number of temporary allocations, i.e. allocations whose free is the
    /// directly following allocator event on the same trace.
    pub temporary: i64,
    /// Bytes not deallocated at the end of the recording.
    pub leaked: i64,
    /// Maximum bytes concurrently live.
    pub peak: i64,
}

impl AddAssign for AllocationData {
    fn add_assign(&mut self, rhs: AllocationData) {
        self.allocations += rhs.allocations;
        self.temporary += rhs.temporary;
        self.leaked += rhs.leaked;
        self.peak += rhs.peak;
    }
}

impl SubAssign for AllocationData {
    fn sub_assign(&mut self, rhs: AllocationData) {
        self.allocations -= rhs.allocations;
        self.temporary -= rhs.temporary;
        self.leaked -= rhs.leaked;
        self.peak -= rhs.peak;
    }
}

/// Aggregated cost of one distinct backtrace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub trace_index: TraceIndex,
    pub data: AllocationData,
}

/// Fingerprint of a single allocator call site: identical `(size, trace)`
/// pairs collapse to one index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationInfo {
    pub size: u64,
    pub trace_index: TraceIndex,
}

/// System parameters reported by the tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub page_size: u64,
    pub pages: u64,
}

impl Default for SystemInfo {
    fn default() -> SystemInfo {
        SystemInfo {
            page_size: 4096,
            pages: 0,
        }
    }
}

/// The cost metric a report is ranked by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CostKind {
    /// Number of calls to allocation functions.
    Allocations,
    /// Number of temporary allocations.
    Temporary,
    /// Bytes not deallocated at the end.
    Leaked,
    /// Bytes consumed at highest total memory consumption.
    Peak,
}

impl CostKind {
    pub fn of(self, data: &AllocationData) -> i64 {
        match self {
            CostKind::Allocations => data.allocations,
            CostKind::Temporary => data.temporary,
            CostKind::Leaked => data.leaked,
            CostKind::Peak => data.peak,
        }
    }

    /// Whether this metric counts events rather than bytes.
    pub fn is_count(self) -> bool {
        matches!(self, CostKind::Allocations | CostKind::Temporary)
    }
}
