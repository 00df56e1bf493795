//! DWARF-based address resolution for a single loaded object.
//!
//! The layout follows the usual addr2line shape: one range mapping per
//! compile unit, a lazily-built list of subprogram ranges per unit, and an
//! inline-scope walk below the covering subprogram. Qualified names are
//! assembled by walking enclosing namespace/class scopes and are cached per
//! DIE offset; cached names are always fully qualified, so a cache hit ends
//! the walk.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use gimli::constants::{
    DW_AT_abstract_origin, DW_AT_call_file, DW_AT_call_line, DW_AT_linkage_name,
    DW_AT_MIPS_linkage_name, DW_AT_name, DW_AT_specification, DW_TAG_catch_block,
    DW_TAG_class_type, DW_TAG_compile_unit, DW_TAG_entry_point, DW_TAG_inlined_subroutine,
    DW_TAG_lexical_block, DW_TAG_module, DW_TAG_namespace, DW_TAG_structure_type,
    DW_TAG_subprogram, DW_TAG_try_block, DW_TAG_with_stmt,
};
use gimli::{AttributeValue, DwAt, DwTag, Reader as _};
use log::debug;
use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};

use crate::symbolize::demangle::Demangler;
use crate::symbolize::symbols::{SymbolCache, SymbolEntry};

type Reader = gimli::EndianArcSlice<gimli::RunTimeEndian>;
type UnitOffset = gimli::UnitOffset<usize>;
type Die<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, Reader>;

/// One frame as recovered from the debug data; empty fields mean the
/// information was unavailable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub function: String,
    pub file: String,
    pub line: i32,
}

/// Resolution result for one address: the surrounding function plus any
/// frames inlined into it, outermost to innermost.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedFrames {
    pub frame: RawFrame,
    pub inlined: Vec<RawFrame>,
}

struct SubprogramRanges {
    offset: UnitOffset,
    ranges: Vec<gimli::Range>,
}

struct LineRow {
    address: u64,
    file: u64,
    line: i32,
    end_sequence: bool,
}

struct CuData {
    unit: gimli::Unit<Reader>,
    /// Bias-corrected absolute address ranges of the unit.
    ranges: Vec<gimli::Range>,
    subprograms: Option<Vec<SubprogramRanges>>,
    /// Tree parent of every scope-carrying DIE seen so far.
    parents: HashMap<UnitOffset, UnitOffset>,
    /// Demangled, fully qualified names per DIE offset.
    die_names: HashMap<UnitOffset, String>,
    /// Fully qualified names of enclosing scopes per DIE offset.
    scope_names: HashMap<UnitOffset, String>,
    lines: Option<Vec<LineRow>>,
    files: HashMap<u64, String>,
}

/// Symbolization state for one loaded object file.
pub struct SymData {
    bias: u64,
    dwarf: gimli::Dwarf<Reader>,
    units: Vec<CuData>,
    symbols: SymbolCache,
}

impl SymData {
    /// Maps the object and copies its DWARF sections and symbol table into
    /// owned state. `address_start` is the load address of the mapping the
    /// module record reported.
    pub fn load(path: &Path, address_start: u64) -> anyhow::Result<SymData> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let map = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to map {:?}", path))?;
        let object = object::File::parse(&*map)
            .with_context(|| format!("failed to parse object file {:?}", path))?;

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let bias = match object.kind() {
            object::ObjectKind::Executable => 0,
            _ => address_start,
        };

        let load_section = |id: gimli::SectionId| -> Result<Reader, gimli::Error> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(Reader::new(Arc::from(data.as_ref()), endian))
        };
        let dwarf = gimli::Dwarf::load(load_section)?;

        let mut symbols = Vec::new();
        for symbol in object.symbols().chain(object.dynamic_symbols()) {
            if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            symbols.push(SymbolEntry::new(
                symbol.address(),
                symbol.size(),
                name.to_owned(),
            ));
        }

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header)?;
            let mut ranges = Vec::new();
            let mut iter = dwarf.unit_ranges(&unit)?;
            while let Some(range) = iter.next()? {
                if range.begin < range.end {
                    ranges.push(gimli::Range {
                        begin: range.begin + bias,
                        end: range.end + bias,
                    });
                }
            }
            if !ranges.is_empty() {
                units.push(CuData {
                    unit,
                    ranges,
                    subprograms: None,
                    parents: HashMap::new(),
                    die_names: HashMap::new(),
                    scope_names: HashMap::new(),
                    lines: None,
                    files: HashMap::new(),
                });
            }
        }

        Ok(SymData {
            bias,
            dwarf,
            units,
            symbols: SymbolCache::new(symbols),
        })
    }

    /// Resolves an absolute address to a function frame and its inlined
    /// frames. Whatever cannot be recovered stays empty; addresses the
    /// DWARF data does not cover fall back to the symbol table.
    pub fn resolve(&mut self, addr: u64, demangler: &Demangler) -> ResolvedFrames {
        let mut frames = match self.resolve_dwarf(addr, demangler) {
            Ok(frames) => frames.unwrap_or_default(),
            Err(err) => {
                debug!("dwarf resolution failed for {:#x}: {}", addr, err);
                ResolvedFrames::default()
            }
        };

        if frames.frame.function.is_empty() {
            let rel_addr = addr.wrapping_sub(self.bias);
            if let Some(symbol) = self.symbols.find(rel_addr, demangler) {
                frames.frame.function = symbol.name.clone();
            }
        }

        frames
    }

    fn resolve_dwarf(
        &mut self,
        addr: u64,
        demangler: &Demangler,
    ) -> gimli::Result<Option<ResolvedFrames>> {
        let Some(unit_index) = self
            .units
            .iter()
            .position(|cu| cu.ranges.iter().any(|r| r.begin <= addr && addr < r.end))
        else {
            return Ok(None);
        };
        let offset = addr - self.bias;

        let dwarf = &self.dwarf;
        let cu = &mut self.units[unit_index];

        let Some(subprogram) = cu.find_subprogram(dwarf, offset)? else {
            return Ok(None);
        };
        let scopes = cu.find_inline_scopes(dwarf, subprogram, offset)?;
        let leaf = cu.line_location(dwarf, offset)?;

        let mut frame = RawFrame {
            function: cu.die_name(dwarf, subprogram, demangler),
            file: String::new(),
            line: 0,
        };
        let mut inlined = Vec::new();

        if scopes.is_empty() {
            if let Some((file, line)) = leaf {
                frame.file = file;
                frame.line = line;
            }
        } else {
            // the subprogram's location is the call site of the outermost
            // inlined scope; the innermost scope gets the line table row
            if let Some((file, line)) = cu.call_location(dwarf, scopes[0])? {
                frame.file = file;
                frame.line = line;
            }
            for (depth, &scope) in scopes.iter().enumerate() {
                let function = cu.die_name(dwarf, scope, demangler);
                let (file, line) = match scopes.get(depth + 1) {
                    Some(&next) => cu.call_location(dwarf, next)?.unwrap_or_default(),
                    None => leaf.clone().unwrap_or_default(),
                };
                inlined.push(RawFrame {
                    function,
                    file,
                    line,
                });
            }
        }

        Ok(Some(ResolvedFrames { frame, inlined }))
    }
}

/// Tags worth descending into while looking for subprograms: DIEs with
/// addresses we can match, plus address-less DIEs that can own them.
fn may_have_scopes(tag: DwTag) -> bool {
    matches!(
        tag,
        DW_TAG_compile_unit
            | DW_TAG_module
            | DW_TAG_lexical_block
            | DW_TAG_with_stmt
            | DW_TAG_catch_block
            | DW_TAG_try_block
            | DW_TAG_entry_point
            | DW_TAG_inlined_subroutine
            | DW_TAG_subprogram
            | DW_TAG_namespace
            | DW_TAG_class_type
            | DW_TAG_structure_type
    )
}

impl CuData {
    fn find_subprogram(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: u64,
    ) -> gimli::Result<Option<UnitOffset>> {
        if self.subprograms.is_none() {
            let mut subprograms = Vec::new();
            let mut tree = self.unit.entries_tree(None)?;
            collect_subprograms(
                dwarf,
                &self.unit,
                tree.root()?,
                None,
                &mut self.parents,
                &mut subprograms,
            )?;
            self.subprograms = Some(subprograms);
        }

        let subprograms = self.subprograms.as_ref().unwrap();
        Ok(subprograms
            .iter()
            .find(|sub| {
                sub.ranges
                    .iter()
                    .any(|r| r.begin <= offset && offset < r.end)
            })
            .map(|sub| sub.offset))
    }

    fn find_inline_scopes(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        subprogram: UnitOffset,
        offset: u64,
    ) -> gimli::Result<Vec<UnitOffset>> {
        let mut scopes = Vec::new();
        let mut tree = self.unit.entries_tree(Some(subprogram))?;
        walk_inline_scopes(
            dwarf,
            &self.unit,
            tree.root()?,
            offset,
            &mut self.parents,
            &mut scopes,
        )?;
        Ok(scopes)
    }

    /// The demangled, fully qualified name for the DIE at `offset`.
    fn die_name(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: UnitOffset,
        demangler: &Demangler,
    ) -> String {
        if let Some(cached) = self.die_names.get(&offset) {
            return cached.clone();
        }
        let name = match self.qualified_die_name(dwarf, offset, demangler) {
            Ok(name) => demangler.demangle(&name),
            Err(err) => {
                debug!("failed to read DIE name: {}", err);
                String::new()
            }
        };
        self.die_names.insert(offset, name.clone());
        name
    }

    fn qualified_die_name(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: UnitOffset,
        demangler: &Demangler,
    ) -> gimli::Result<String> {
        let parts = {
            let entry = self.unit.entry(offset)?;
            read_name_parts(dwarf, &self.unit, &entry)?
        };

        // linkage names are fully qualified already
        if let Some(linkage) = parts.linkage {
            return Ok(linkage);
        }

        let own = parts.name.unwrap_or_default();
        // a member definition is scoped where its declaration lives
        let anchor = parts.specification.unwrap_or(offset);
        let prefix = match self.parents.get(&anchor).copied() {
            Some(parent) => self.scope_name(dwarf, parent, demangler, 0)?,
            None => String::new(),
        };
        Ok(join_scopes(&prefix, &own))
    }

    /// The fully qualified name of the scope DIE at `offset`, built from
    /// its own name and all enclosing named scopes.
    fn scope_name(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: UnitOffset,
        demangler: &Demangler,
        depth: usize,
    ) -> gimli::Result<String> {
        if let Some(cached) = self.scope_names.get(&offset) {
            return Ok(cached.clone());
        }
        if depth > 16 {
            return Ok(String::new());
        }

        let parts = {
            let entry = self.unit.entry(offset)?;
            read_name_parts(dwarf, &self.unit, &entry)?
        };

        let name = if let Some(linkage) = parts.linkage {
            // scope linkage names come mangled; mixing mangled and plain
            // segments would be unreadable
            demangler.demangle(&linkage)
        } else {
            let own = parts.name.unwrap_or_default();
            let anchor = parts.specification.unwrap_or(offset);
            let prefix = match self.parents.get(&anchor).copied() {
                Some(parent) => self.scope_name(dwarf, parent, demangler, depth + 1)?,
                None => String::new(),
            };
            join_scopes(&prefix, &own)
        };

        self.scope_names.insert(offset, name.clone());
        Ok(name)
    }

    /// `DW_AT_call_file`/`DW_AT_call_line` of an inlined scope.
    fn call_location(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: UnitOffset,
    ) -> gimli::Result<Option<(String, i32)>> {
        self.ensure_lines(dwarf)?;

        let (file_index, line) = {
            let entry = self.unit.entry(offset)?;
            let file_index = match entry.attr_value(DW_AT_call_file)? {
                Some(AttributeValue::FileIndex(index)) => Some(index),
                Some(other) => other.udata_value(),
                None => None,
            };
            let line = entry
                .attr_value(DW_AT_call_line)?
                .and_then(|value| value.udata_value())
                .unwrap_or(0) as i32;
            (file_index, line)
        };

        let Some(file_index) = file_index else {
            return Ok(None);
        };
        let file = self.files.get(&file_index).cloned().unwrap_or_default();
        Ok(Some((file, line)))
    }

    /// File and line covering a bias-corrected address, from the unit's
    /// line table.
    fn line_location(
        &mut self,
        dwarf: &gimli::Dwarf<Reader>,
        offset: u64,
    ) -> gimli::Result<Option<(String, i32)>> {
        self.ensure_lines(dwarf)?;
        let rows = self.lines.as_ref().unwrap();

        let idx = rows.partition_point(|row| row.address <= offset);
        if idx == 0 {
            return Ok(None);
        }
        let row = &rows[idx - 1];
        if row.end_sequence {
            return Ok(None);
        }
        let file = self.files.get(&row.file).cloned().unwrap_or_default();
        Ok(Some((file, row.line)))
    }

    fn ensure_lines(&mut self, dwarf: &gimli::Dwarf<Reader>) -> gimli::Result<()> {
        if self.lines.is_some() {
            return Ok(());
        }

        let mut table = Vec::new();
        if let Some(program) = self.unit.line_program.clone() {
            let comp_dir = self
                .unit
                .comp_dir
                .as_ref()
                .and_then(|dir| dir.to_string_lossy().ok().map(Cow::into_owned))
                .unwrap_or_default();

            // resolve every file referenced by the program up front; the
            // indices also serve DW_AT_call_file lookups
            let header = program.header().clone();
            let file_count = header.file_names().len() as u64;
            for index in 0..file_count + 2 {
                if let Some(file) = header.file(index) {
                    let path = render_file(dwarf, &self.unit, &header, file, &comp_dir);
                    self.files.insert(index, path);
                }
            }

            let mut rows = program.rows();
            while let Some((_, row)) = rows.next_row()? {
                if row.address() == u64::MAX {
                    // tombstone sequence dropped by the linker
                    continue;
                }
                table.push(LineRow {
                    address: row.address(),
                    file: row.file_index(),
                    line: row
                        .line()
                        .map(|line| line.get() as i32)
                        .unwrap_or_default(),
                    end_sequence: row.end_sequence(),
                });
            }
            table.sort_by_key(|row| row.address);
        }

        self.lines = Some(table);
        Ok(())
    }
}

struct NameParts {
    linkage: Option<String>,
    name: Option<String>,
    specification: Option<UnitOffset>,
}

fn read_name_parts(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &Die,
) -> gimli::Result<NameParts> {
    let linkage = match attr_integrate(unit, entry.offset(), DW_AT_MIPS_linkage_name, 0)? {
        Some(value) => Some(value),
        None => attr_integrate(unit, entry.offset(), DW_AT_linkage_name, 0)?,
    };
    let linkage = linkage.and_then(|value| attr_to_string(dwarf, unit, value));

    let name = attr_integrate(unit, entry.offset(), DW_AT_name, 0)?
        .and_then(|value| attr_to_string(dwarf, unit, value));

    let specification = match entry.attr_value(DW_AT_specification)? {
        Some(AttributeValue::UnitRef(target)) => Some(target),
        _ => None,
    };

    Ok(NameParts {
        linkage,
        name,
        specification,
    })
}

/// Reads an attribute, following `DW_AT_abstract_origin` and
/// `DW_AT_specification` references the way `dwarf_attr_integrate` does.
fn attr_integrate(
    unit: &gimli::Unit<Reader>,
    offset: UnitOffset,
    name: DwAt,
    depth: usize,
) -> gimli::Result<Option<AttributeValue<Reader>>> {
    let entry = unit.entry(offset)?;
    if let Some(value) = entry.attr_value(name)? {
        return Ok(Some(value));
    }
    if depth >= 16 {
        return Ok(None);
    }
    for follow in [DW_AT_abstract_origin, DW_AT_specification] {
        if let Some(AttributeValue::UnitRef(target)) = entry.attr_value(follow)? {
            if let Some(value) = attr_integrate(unit, target, name, depth + 1)? {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

fn attr_to_string(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    value: AttributeValue<Reader>,
) -> Option<String> {
    dwarf
        .attr_string(unit, value)
        .ok()
        .and_then(|s| s.to_string_lossy().ok().map(Cow::into_owned))
}

fn join_scopes(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_owned(),
        (_, true) => prefix.to_owned(),
        _ => format!("{}::{}", prefix, name),
    }
}

/// Resolves one line-table file entry against its directory and the unit's
/// compilation directory; relative paths become absolute.
fn render_file(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    header: &gimli::LineProgramHeader<Reader>,
    file: &gimli::FileEntry<Reader>,
    comp_dir: &str,
) -> String {
    let name = attr_to_string(dwarf, unit, file.path_name()).unwrap_or_default();
    if name.starts_with('/') {
        return name;
    }

    let dir = file
        .directory(header)
        .and_then(|value| attr_to_string(dwarf, unit, value))
        .unwrap_or_default();

    let mut path = String::new();
    if dir.starts_with('/') {
        path.push_str(&dir);
    } else {
        path.push_str(comp_dir);
        if !dir.is_empty() {
            if !path.is_empty() && !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(&dir);
        }
    }
    if !path.is_empty() && !path.ends_with('/') {
        path.push('/');
    }
    path.push_str(&name);
    path
}

fn collect_subprograms(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    node: gimli::EntriesTreeNode<Reader>,
    parent: Option<UnitOffset>,
    parents: &mut HashMap<UnitOffset, UnitOffset>,
    out: &mut Vec<SubprogramRanges>,
) -> gimli::Result<()> {
    let offset = node.entry().offset();
    let tag = node.entry().tag();
    if let Some(parent) = parent {
        parents.insert(offset, parent);
    }

    if tag == DW_TAG_subprogram {
        let ranges = die_ranges(dwarf, unit, node.entry())?;
        if !ranges.is_empty() {
            out.push(SubprogramRanges { offset, ranges });
        }
        // subprogram bodies are walked on demand for inline scopes
        return Ok(());
    }

    if parent.is_some() && !may_have_scopes(tag) {
        return Ok(());
    }

    let mut children = node.children();
    while let Some(child) = children.next()? {
        collect_subprograms(dwarf, unit, child, Some(offset), parents, out)?;
    }
    Ok(())
}

fn walk_inline_scopes(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    node: gimli::EntriesTreeNode<Reader>,
    offset: u64,
    parents: &mut HashMap<UnitOffset, UnitOffset>,
    out: &mut Vec<UnitOffset>,
) -> gimli::Result<()> {
    let parent_offset = node.entry().offset();
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let child_offset = child.entry().offset();
        parents.insert(child_offset, parent_offset);

        if child.entry().tag() == DW_TAG_inlined_subroutine {
            if die_contains(dwarf, unit, child.entry(), offset)? {
                out.push(child_offset);
                walk_inline_scopes(dwarf, unit, child, offset, parents, out)?;
            }
        } else {
            walk_inline_scopes(dwarf, unit, child, offset, parents, out)?;
        }
    }
    Ok(())
}

fn die_ranges(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &Die,
) -> gimli::Result<Vec<gimli::Range>> {
    let mut ranges = Vec::new();
    let mut iter = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = iter.next()? {
        if range.begin < range.end {
            ranges.push(range);
        }
    }
    Ok(ranges)
}

fn die_contains(
    dwarf: &gimli::Dwarf<Reader>,
    unit: &gimli::Unit<Reader>,
    entry: &Die,
    offset: u64,
) -> gimli::Result<bool> {
    let mut iter = dwarf.die_ranges(unit, entry)?;
    while let Some(range) = iter.next()? {
        if range.begin <= offset && offset < range.end {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_scopes_skips_empty_segments() {
        assert_eq!(join_scopes("", "foo"), "foo");
        assert_eq!(join_scopes("ns", ""), "ns");
        assert_eq!(join_scopes("ns", "foo"), "ns::foo");
        assert_eq!(join_scopes("", ""), "");
    }

    #[test]
    fn scope_tags() {
        assert!(may_have_scopes(DW_TAG_namespace));
        assert!(may_have_scopes(DW_TAG_subprogram));
        assert!(may_have_scopes(DW_TAG_lexical_block));
        assert!(!may_have_scopes(gimli::constants::DW_TAG_base_type));
    }
}
