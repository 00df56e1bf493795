//! heapscope analyzes heap allocation profiles of native programs: it
//! reads the event stream recorded by an in-process allocator tracer,
//! resolves instruction pointers to symbolic frames via DWARF, and folds
//! every allocation into a per-call-site cost model that backs the leak,
//! peak, temporary-allocation and call-count reports as well as the
//! massif, flamegraph and histogram exports.

pub mod analyze;
pub mod core;
pub mod symbolize;
pub mod ui;
