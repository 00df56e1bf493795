//! Flamegraph export in the collapsed-stack format: one line per
//! backtrace, frames top-down separated by semicolons, then the selected
//! cost.

use std::collections::HashSet;
use std::io::{self, Write};

use crate::analyze::data::TraceData;
use crate::core::types::{Allocation, CostKind, InstructionPointer};
use crate::ui::report::pretty_function;

pub fn write_flamegraph(
    data: &TraceData,
    w: &mut dyn Write,
    allocations: &[Allocation],
    cost: CostKind,
    shorten_templates: bool,
) -> io::Result<()> {
    for allocation in allocations {
        if !allocation.trace_index.is_valid() {
            write!(w, "??")?;
        } else {
            // walk to the stop frame, then emit top-down
            let mut nodes = Vec::new();
            let mut guard = HashSet::new();
            let mut index = allocation.trace_index;
            while index.is_valid() && guard.insert(index) {
                let node = data.find_trace(index);
                if !node.ip_index.is_valid() {
                    break;
                }
                nodes.push(node.ip_index);
                if data.is_stop_index(data.find_ip(node.ip_index).frame.function) {
                    break;
                }
                index = node.parent_index;
            }
            for ip_index in nodes.iter().rev() {
                write_ip(data, w, &data.find_ip(*ip_index), shorten_templates)?;
            }
        }
        writeln!(w, " {}", cost.of(&allocation.data))?;
    }
    Ok(())
}

fn write_ip(
    data: &TraceData,
    w: &mut dyn Write,
    ip: &InstructionPointer,
    shorten_templates: bool,
) -> io::Result<()> {
    let write_file = |w: &mut dyn Write, file: &str| -> io::Result<()> {
        let base = file.rsplit('/').next().unwrap_or(file);
        write!(w, " ({})", base)
    };

    if ip.frame.function.is_valid() {
        write!(
            w,
            "{}",
            pretty_function(data.string(ip.frame.function), shorten_templates)
        )?;
    } else {
        write!(w, "0x{:x}", ip.instruction_pointer)?;
    }
    if ip.frame.file.is_valid() {
        write_file(w, data.string(ip.frame.file))?;
    }
    write!(w, ";")?;

    for inlined in &ip.inlined {
        write!(
            w,
            "{}",
            pretty_function(data.string(inlined.function), shorten_templates)
        )?;
        write_file(w, data.string(inlined.file))?;
        write!(w, ";")?;
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

    #[test]
    fn emits_top_down_lines_with_cost() {
        let data = read(
            "s app\ns main\ns alloc\ns /src/a.c\n\
             i 100 1 2 0 0\ni 200 1 3 4 a\n\
             t 100 0\nt 200 1\n\
             + 100 2 a0\n+ 100 2 b0\n",
        );
        let mut out = Vec::new();
        write_flamegraph(
            &data,
            &mut out,
            &data.allocations,
            CostKind::Allocations,
            true,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "main;alloc (a.c); 2\n");
    }

    #[test]
    fn selects_the_requested_cost() {
        let data = read("s app\ns alloc\ni 200 1 2 0 0\nt 200 0\n+ 100 1 a0\n");
        let mut out = Vec::new();
        write_flamegraph(&data, &mut out, &data.allocations, CostKind::Leaked, true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "alloc; 256\n");
    }

    #[test]
    fn inlined_frames_share_the_line() {
        let data = read(
            "s app\ns outer\ns /src/o.c\ns inner\ns /src/i.c\n\
             i 100 1 2 3 5 4 5 9\nt 100 0\n+ 10 1 a0\n",
        );
        let mut out = Vec::new();
        write_flamegraph(&data, &mut out, &data.allocations, CostKind::Allocations, true).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "outer (o.c);inner (i.c); 1\n"
        );
    }

    #[test]
    fn unresolved_traces_become_question_marks() {
        let data = read("+ 10 0 a0\n");
        let mut out = Vec::new();
        write_flamegraph(&data, &mut out, &data.allocations, CostKind::Allocations, true).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "?? 1\n");
    }
}
