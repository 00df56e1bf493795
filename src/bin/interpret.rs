//! Resolves a raw heap profile stream into a self-contained one: reads
//! records on stdin, symbolizes first-seen instruction pointers through
//! the recorded module table, and writes the enriched stream to stdout.

use std::io::{self, BufWriter, Write};
use std::process;

use heapscope::analyze::interpreter::Interpreter;

fn main() {
    env_logger::init();

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut input = stdin.lock();
    let mut output = BufWriter::new(stdout.lock());

    let mut interpreter = Interpreter::new(&mut output);
    if let Err(err) = interpreter.run(&mut input) {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
    if let Err(err) = output.flush() {
        eprintln!("Error: {}", err);
        process::exit(1);
    }
}
