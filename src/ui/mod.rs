pub mod flamegraph;
pub mod histogram;
pub mod massif;
pub mod report;

use std::fs::File;
use std::io::BufWriter;

use crate::analyze::data::{EventSink, TraceData};
use crate::core::types::{AllocationIndex, AllocationInfo};
use crate::ui::histogram::Histogram;
use crate::ui::massif::MassifWriter;

/// Event hooks of the report engine: drives the massif export and the size
/// histogram while the stream is read.
pub struct ReportSink {
    pub massif: Option<MassifWriter<BufWriter<File>>>,
    pub histogram: Option<Histogram>,
}

impl ReportSink {
    pub fn new(
        massif: Option<MassifWriter<BufWriter<File>>>,
        histogram: Option<Histogram>,
    ) -> ReportSink {
        ReportSink { massif, histogram }
    }
}

impl EventSink for ReportSink {
    fn on_allocation(&mut self, data: &TraceData, info: AllocationInfo, _index: AllocationIndex) {
        if let Some(histogram) = &mut self.histogram {
            histogram.add(info.size);
        }
        if let Some(massif) = &mut self.massif {
            massif.track_allocation(data);
        }
    }

    fn on_timestamp(&mut self, data: &TraceData, _old_ms: u64, new_ms: u64, is_last: bool) {
        if let Some(massif) = &mut self.massif {
            massif.write_snapshot(data, new_ms, is_last);
        }
    }

    fn on_debuggee(&mut self, _data: &TraceData, command: &str) {
        println!("Debuggee command was: {}", command);
        if let Some(massif) = &mut self.massif {
            massif.write_header(command);
        }
    }
}
