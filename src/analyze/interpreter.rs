//! Pass-through interpreter: rewrites a raw event stream into a resolved
//! one that no longer needs the traced machine's binaries.
//!
//! Module records are consumed, every first-seen instruction pointer is
//! symbolized and emitted as `s`/`i` records, and all other records pass
//! through verbatim, so further stages can layer on top of the output.

use std::collections::HashSet;
use std::io::{BufRead, Write};

use crate::core::reader::{LineReader, ReadError};
use crate::core::strings::Interner;
use crate::core::types::StringIndex;
use crate::symbolize::demangle::Demangler;
use crate::symbolize::dwarf::RawFrame;
use crate::symbolize::modules::ModuleRegistry;

pub struct Interpreter<W: Write> {
    out: W,
    strings: Interner,
    registry: ModuleRegistry,
    demangler: Demangler,
    encountered_ips: HashSet<u64>,
}

impl<W: Write> Interpreter<W> {
    pub fn new(out: W) -> Interpreter<W> {
        Interpreter {
            out,
            strings: Interner::new(),
            registry: ModuleRegistry::new(),
            demangler: Demangler::new(),
            encountered_ips: HashSet::new(),
        }
    }

    pub fn run<R: BufRead>(&mut self, input: &mut R) -> Result<(), ReadError> {
        let mut reader = LineReader::new();
        while reader.next_line(input)? {
            match reader.mode() {
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
                't' => {
                    let ip = reader.read_hex().ok_or_else(|| reader.malformed())?;
                    reader.read_hex().ok_or_else(|| reader.malformed())?;
                    self.add_ip(ip)?;
                    writeln!(self.out, "{}", reader.line())?;
                }
                _ => {
                    writeln!(self.out, "{}", reader.line())?;
                }
            }
        }
        Ok(())
    }

    /// Interns a string, echoing an `s` record the first time it is seen.
    fn intern(&mut self, s: &str) -> Result<StringIndex, ReadError> {
        let before = self.strings.len();
        let index = self.strings.intern(s);
        if self.strings.len() > before {
            writeln!(self.out, "s {}", s)?;
        }
        Ok(index)
    }

    /// Symbolizes a first-seen instruction pointer and emits its `i`
    /// record. Unresolvable addresses still get a record so that the
    /// analyzer can render them as raw addresses.
    fn add_ip(&mut self, raw: u64) -> Result<(), ReadError> {
        if raw == 0 || !self.encountered_ips.insert(raw) {
            return Ok(());
        }

        let resolved = self.registry.resolve_ip(raw, &self.demangler);

        let mut module = StringIndex(0);
        let mut frame = RawFrame::default();
        let mut inlined = Vec::new();
        if let Some(resolved) = resolved {
            module = self.intern(&resolved.module)?;
            if let Some(frames) = resolved.frames {
                frame = frames.frame;
                inlined = frames.inlined;
            }
        }

        let function = self.intern(&frame.function)?;
        let file = self.intern(&frame.file)?;

        write!(self.out, "i {:x} {:x}", raw, module.0)?;
        if function.is_valid() || file.is_valid() {
            write!(self.out, " {:x}", function.0)?;
            if file.is_valid() {
                write!(self.out, " {:x} {:x}", file.0, frame.line)?;
                for frame in &inlined {
                    let function = self.intern(&frame.function)?;
                    let file = self.intern(&frame.file)?;
                    write!(self.out, " {:x} {:x} {:x}", function.0, file.0, frame.line)?;
                }
            }
        }
        writeln!(self.out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::data::{NullSink, TraceData};
    use std::io::Cursor;

    fn interpret(input: &str) -> String {
        let mut out = Vec::new();
        let mut interpreter = Interpreter::new(&mut out);
        let mut cursor = Cursor::new(input.as_bytes().to_vec());
        interpreter.run(&mut cursor).expect("stream must parse");
        String::from_utf8(out).expect("output is utf8")
    }

    fn analyze(input: &str) -> TraceData {
        let mut data = TraceData::new();
        let mut cursor = Cursor::new(input.as_bytes().to_vec());
        data.read(&mut cursor, &mut NullSink).expect("stream must parse");
        data.finalize();
        data
    }

    #[test]
    fn passes_unknown_records_through() {
        let output = interpret("z 123 foo\nX ./app\nc 1f4\n");
        assert_eq!(output, "z 123 foo\nX ./app\nc 1f4\n");
    }

    #[test]
    fn consumes_module_records_and_declares_ips() {
        let output = interpret("m /nonexistent/bin 1 1000 2000\nt 1500 0\n+ 10 1 a0\n");
        // the module file cannot be loaded, so only its name resolves
        assert_eq!(output, "s /nonexistent/bin\ni 1500 1\nt 1500 0\n+ 10 1 a0\n");
    }

    #[test]
    fn declares_each_ip_once() {
        let output = interpret("t 1500 0\nt 1500 1\n");
        assert_eq!(output, "i 1500 0\nt 1500 0\nt 1500 1\n");
    }

    #[test]
    fn round_trip_preserves_the_cost_model() {
        let raw = "m /nonexistent/bin 1 1000 2000\n\
                   t 1500 0\nt 1600 1\n\
                   + 100 2 a0\n+ 10 1 b0\n- b0\nc 3e8\nR 20\n";
        let resolved = interpret(raw);
        let direct = analyze(raw);
        let reread = analyze(&resolved);

        assert_eq!(direct.total_cost, reread.total_cost);
        assert_eq!(direct.total_time, reread.total_time);
        assert_eq!(direct.peak_rss, reread.peak_rss);
        assert_eq!(direct.traces, reread.traces);
        assert_eq!(direct.allocations, reread.allocations);
        // the resolved stream needs no module registry anymore
        assert!(reread.registry.is_empty());
    }
}
