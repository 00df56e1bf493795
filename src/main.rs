use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use log::warn;

use heapscope::analyze::data::{read_file, NullSink};
use heapscope::analyze::suppressions::{builtin_suppressions, parse_suppressions_file};
use heapscope::core::types::CostKind;
use heapscope::ui::flamegraph::write_flamegraph;
use heapscope::ui::histogram::Histogram;
use heapscope::ui::massif::MassifWriter;
use heapscope::ui::report::{
    print_summary, print_suppressions, FormatBytes, ReportOptions, Reporter,
};
use heapscope::ui::ReportSink;

/// Analyze heap profile data files.
///
/// heapscope records information about calls to heap allocation functions
/// such as malloc and operator new; this tool evaluates the generated data
/// files.
#[derive(Debug, Parser)]
#[command(name = "heapscope", version)]
struct Args {
    /// The heap profile data file to print.
    file: PathBuf,

    /// Find the differences to this file.
    #[arg(short, long)]
    diff: Option<PathBuf>,

    /// Shorten template identifiers.
    #[arg(short = 't', long, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    shorten_templates: bool,

    /// Merge backtraces that end up in the same allocation call site.
    #[arg(short = 'm', long, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    merge_backtraces: bool,

    /// Print backtraces to top allocators, sorted by peak consumption.
    #[arg(short = 'p', long, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_peaks: bool,

    /// Print backtraces to top allocators, sorted by number of calls to
    /// allocation functions.
    #[arg(short = 'a', long, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_allocators: bool,

    /// Print backtraces to top allocators, sorted by number of temporary
    /// allocations.
    #[arg(short = 'T', long, default_value_t = true, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_temporary: bool,

    /// Print backtraces to leaked memory allocations.
    #[arg(short = 'l', long, default_value_t = false, action = ArgAction::Set,
          num_args = 0..=1, default_missing_value = "true")]
    print_leaks: bool,

    /// Limit the number of reported peaks.
    #[arg(short = 'n', long, default_value_t = 10)]
    peak_limit: usize,

    /// Limit the number of reported backtraces of merged peak locations.
    #[arg(short = 's', long, default_value_t = 5)]
    sub_peak_limit: usize,

    /// Path to output file where an allocation size histogram will be
    /// written to.
    #[arg(short = 'H', long, value_name = "PATH")]
    print_histogram: Option<PathBuf>,

    /// Path to output file where a flame-graph compatible stack file will
    /// be written to, for use with flamegraph.pl.
    #[arg(short = 'F', long, value_name = "PATH")]
    print_flamegraph: Option<PathBuf>,

    /// The cost type to use when generating a flamegraph.
    #[arg(long, value_enum, default_value_t = CostKind::Allocations)]
    flamegraph_cost_type: CostKind,

    /// Path to output file where a massif compatible data file will be
    /// written to.
    #[arg(short = 'M', long, value_name = "PATH")]
    print_massif: Option<PathBuf>,

    /// Percentage of current memory usage, below which allocations are
    /// aggregated into a 'below threshold' entry of the massif output.
    #[arg(long, default_value_t = 1.0)]
    massif_threshold: f64,

    /// Frequency of detailed snapshots in the massif output file; zero
    /// disables detailed snapshots.
    #[arg(long, default_value_t = 2)]
    massif_detailed_freq: u64,

    /// Only print allocations where the backtrace contains the given
    /// function.
    #[arg(long, value_name = "STR")]
    filter_bt_function: Option<String>,

    /// Load leak suppression rules from this file.
    #[arg(long, value_name = "PATH")]
    suppressions: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {:#}", err);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    let mut suppressions = builtin_suppressions();
    if let Some(path) = &args.suppressions {
        suppressions.extend(parse_suppressions_file(path)?);
    }

    // open every output sink up front, so that a bad path aborts before
    // the expensive read instead of after it
    let massif = args
        .print_massif
        .as_ref()
        .map(|path| {
            File::create(path)
                .with_context(|| format!("failed to open massif output file {:?}", path))
                .map(|file| {
                    MassifWriter::new(
                        BufWriter::new(file),
                        args.massif_threshold,
                        args.massif_detailed_freq,
                    )
                })
        })
        .transpose()?;
    let histogram_out = args
        .print_histogram
        .as_ref()
        .map(|path| {
            File::create(path)
                .with_context(|| format!("failed to open histogram output file {:?}", path))
        })
        .transpose()?;
    let flamegraph_out = args
        .print_flamegraph
        .as_ref()
        .map(|path| {
            File::create(path)
                .with_context(|| format!("failed to open flamegraph output file {:?}", path))
        })
        .transpose()?;

    let mut sink = ReportSink::new(massif, args.print_histogram.as_ref().map(|_| Histogram::new()));

    let diff_reader = args.diff.clone().map(|path| {
        println!(
            "reading diff file {:?} - please wait, this might take some time...",
            path
        );
        thread::spawn(move || read_file(&path, Vec::new(), &mut NullSink))
    });

    println!(
        "reading file {:?} - please wait, this might take some time...",
        args.file
    );
    let mut data = read_file(&args.file, suppressions, &mut sink)?;

    if let Some(reader) = diff_reader {
        let base = reader
            .join()
            .map_err(|_| anyhow!("diff reader thread panicked"))??;
        data.diff(&base);
    }

    println!("finished reading file, now analyzing data:\n");

    let options = ReportOptions {
        shorten_templates: args.shorten_templates,
        merge_backtraces: args.merge_backtraces,
        peak_limit: args.peak_limit,
        sub_peak_limit: args.sub_peak_limit,
    };
    let mut reporter = Reporter::new(&data, options, args.filter_bt_function.as_deref());

    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.print_allocators {
        writeln!(out, "MOST CALLS TO ALLOCATION FUNCTIONS")?;
        reporter.print_allocations(
            &mut out,
            CostKind::Allocations,
            &|w, d| {
                writeln!(
                    w,
                    "{} calls to allocation functions with {} peak consumption from",
                    d.allocations,
                    FormatBytes(d.peak)
                )
            },
            &|w, d| {
                writeln!(
                    w,
                    "{} calls with {} peak consumption from:",
                    d.allocations,
                    FormatBytes(d.peak)
                )
            },
        )?;
        writeln!(out)?;
    }

    if args.print_peaks {
        writeln!(out, "PEAK MEMORY CONSUMERS")?;
        reporter.print_allocations(
            &mut out,
            CostKind::Peak,
            &|w, d| {
                writeln!(
                    w,
                    "{} peak memory consumed over {} calls from",
                    FormatBytes(d.peak),
                    d.allocations
                )
            },
            &|w, d| {
                writeln!(
                    w,
                    "{} consumed over {} calls from:",
                    FormatBytes(d.peak),
                    d.allocations
                )
            },
        )?;
        writeln!(out)?;
    }

    if args.print_leaks {
        writeln!(out, "MEMORY LEAKS")?;
        reporter.print_allocations(
            &mut out,
            CostKind::Leaked,
            &|w, d| {
                writeln!(
                    w,
                    "{} leaked over {} calls from",
                    FormatBytes(d.leaked),
                    d.allocations
                )
            },
            &|w, d| {
                writeln!(
                    w,
                    "{} leaked over {} calls from:",
                    FormatBytes(d.leaked),
                    d.allocations
                )
            },
        )?;
        writeln!(out)?;
    }

    if args.print_temporary {
        writeln!(out, "MOST TEMPORARY ALLOCATIONS")?;
        reporter.print_allocations(
            &mut out,
            CostKind::Temporary,
            &|w, d| {
                writeln!(
                    w,
                    "{} temporary allocations of {} allocations in total ({:.2}%) from",
                    d.temporary,
                    d.allocations,
                    temporary_percent(d.temporary, d.allocations)
                )
            },
            &|w, d| {
                writeln!(
                    w,
                    "{} temporary allocations of {} allocations in total ({:.2}%) from:",
                    d.temporary,
                    d.allocations,
                    temporary_percent(d.temporary, d.allocations)
                )
            },
        )?;
        writeln!(out)?;
    }

    print_summary(&data, &mut out)?;
    print_suppressions(&data, &mut out)?;
    out.flush()?;

    if let (Some(histogram), Some(file)) = (&sink.histogram, histogram_out) {
        let mut w = BufWriter::new(file);
        histogram.write(&mut w)?;
        w.flush()?;
    }

    if let Some(file) = flamegraph_out {
        let mut w = BufWriter::new(file);
        write_flamegraph(
            &data,
            &mut w,
            reporter.allocations(),
            args.flamegraph_cost_type,
            options.shorten_templates,
        )?;
        w.flush()?;
    }

    if let Some(massif) = sink.massif.take() {
        if let Err(err) = massif.into_inner().flush() {
            warn!("failed to flush massif output: {}", err);
        }
    }

    Ok(())
}

fn temporary_percent(temporary: i64, allocations: i64) -> f64 {
    if allocations == 0 {
        return 0.0;
    }
    temporary as f64 * 100.0 / allocations as f64
}
