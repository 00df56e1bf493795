//! Suppression rules for known-benign leaks.
//!
//! Rule files hold one `leak:<pattern>` per line, with `#` comments. The
//! pattern language is the sanitizer one: a leading `^` anchors to the
//! start, a trailing `$` to the end, `*` matches any run of characters,
//! everything else is literal. A trace is suppressed when any of its
//! function names (inlined frames included) matches a pattern.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context as _;
use log::warn;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Suppression {
    pub pattern: String,
    /// Number of allocations whose trace matched.
    pub matches: i64,
    /// Bytes still leaked by matched traces at the end of the run.
    pub leaked: i64,
}

impl Suppression {
    fn new(pattern: &str) -> Suppression {
        Suppression {
            pattern: pattern.to_owned(),
            matches: 0,
            leaked: 0,
        }
    }
}

/// Suppressions applied to every run: allocations made once by the runtime,
/// the dynamic loader and the glib main loop that live until process exit.
pub fn builtin_suppressions() -> Vec<Suppression> {
    [
        // libc
        "__nss_module_allocate",
        "__gconv_read_conf",
        "__new_exitfn",
        "tzset_internal",
        // dynamic linker
        "dl_open_worker",
        // glib event loop
        "g_main_context_new",
        "g_thread_self",
    ]
    .iter()
    .map(|pattern| Suppression::new(pattern))
    .collect()
}

/// Parses one suppression file line; comments and blank lines yield `None`,
/// anything else without the `leak:` marker is diagnosed and dropped.
pub fn parse_suppression(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if let Some(pattern) = line.strip_prefix("leak:") {
        return Some(pattern.to_owned());
    }
    warn!("invalid suppression line: {}", line);
    None
}

pub fn format_suppression(pattern: &str) -> String {
    format!("leak:{}", pattern)
}

pub fn parse_suppressions_file(path: &Path) -> anyhow::Result<Vec<Suppression>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open suppression file {:?}", path))?;
    let mut suppressions = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(pattern) = parse_suppression(&line) {
            suppressions.push(Suppression::new(&pattern));
        }
    }
    Ok(suppressions)
}

pub fn matches_suppression(pattern: &str, haystack: &str) -> bool {
    pattern == haystack || template_match(pattern, haystack)
}

/// Port of the sanitizer TemplateMatch. `$` matches at the end of the
/// haystack, or anywhere after a `*`.
fn template_match(pattern: &str, haystack: &str) -> bool {
    if haystack.is_empty() {
        return false;
    }

    let mut pattern = pattern;
    let mut haystack = haystack;
    let mut start = false;
    if let Some(rest) = pattern.strip_prefix('^') {
        start = true;
        pattern = rest;
    }

    let mut asterisk = false;
    while !pattern.is_empty() {
        if let Some(rest) = pattern.strip_prefix('*') {
            pattern = rest;
            start = false;
            asterisk = true;
            continue;
        }
        if pattern.starts_with('$') {
            return haystack.is_empty() || asterisk;
        }
        if haystack.is_empty() {
            return false;
        }

        let chunk_end = pattern
            .find(['*', '$'])
            .unwrap_or(pattern.len());
        let chunk = &pattern[..chunk_end];

        let Some(pos) = haystack.find(chunk) else {
            return false;
        };
        if start && pos != 0 {
            return false;
        }

        haystack = &haystack[pos + chunk.len()..];
        pattern = &pattern[chunk_end..];
        start = false;
        asterisk = false;
    }
    true
}
