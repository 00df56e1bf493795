//! Symbol-table fallback for addresses the DWARF data cannot resolve.

use crate::symbolize::demangle::Demangler;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    pub offset: u64,
    pub size: u64,
    pub name: String,
    demangled: bool,
}

impl SymbolEntry {
    pub fn new(offset: u64, size: u64, name: String) -> SymbolEntry {
        SymbolEntry {
            offset,
            size,
            name,
            demangled: false,
        }
    }
}

/// Per-module symbol lookup, sorted by offset. Entries sharing an offset
/// keep their insertion order and the first one wins, which is what
/// addr2line reports for aliased symbols like `__memmove_avx_unaligned` /
/// `__memcpy_avx_unaligned`.
#[derive(Default)]
pub struct SymbolCache {
    symbols: Vec<SymbolEntry>,
}

impl SymbolCache {
    pub fn new(mut symbols: Vec<SymbolEntry>) -> SymbolCache {
        symbols.sort_by_key(|entry| entry.offset);
        symbols.dedup_by(|a, b| a.offset == b.offset && a.size == b.size);
        SymbolCache { symbols }
    }

    /// Looks up the symbol covering `rel_addr`, demangling it on first use.
    /// A symbol with size 0 covers everything past its offset, so stripped
    /// size information does not lose the tail of a module.
    pub fn find(&mut self, rel_addr: u64, demangler: &Demangler) -> Option<&SymbolEntry> {
        let idx = self.symbols.partition_point(|entry| entry.offset < rel_addr);

        let idx = if self
            .symbols
            .get(idx)
            .is_some_and(|entry| entry.offset == rel_addr)
        {
            idx
        } else if idx == 0 {
            return None;
        } else {
            let idx = idx - 1;
            let entry = &self.symbols[idx];
            if !(entry.offset <= rel_addr && (entry.offset + entry.size > rel_addr || entry.size == 0))
            {
                return None;
            }
            idx
        };

        let entry = &mut self.symbols[idx];
        if !entry.demangled {
            entry.name = demangler.demangle(&entry.name);
            entry.demangled = true;
        }
        Some(&self.symbols[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> SymbolCache {
        SymbolCache::new(vec![
            SymbolEntry::new(0x100, 0x10, "first".into()),
            SymbolEntry::new(0x100, 0x10, "aliased_duplicate".into()),
            SymbolEntry::new(0x200, 0x20, "second".into()),
            SymbolEntry::new(0x400, 0, "unbounded".into()),
        ])
    }

    #[test]
    fn exact_and_interior_hits() {
        let demangler = Demangler::new();
        let mut cache = cache();
        assert_eq!(cache.find(0x100, &demangler).unwrap().name, "first");
        assert_eq!(cache.find(0x10f, &demangler).unwrap().name, "first");
        assert_eq!(cache.find(0x21f, &demangler).unwrap().name, "second");
    }

    #[test]
    fn misses_between_symbols() {
        let demangler = Demangler::new();
        let mut cache = cache();
        assert!(cache.find(0x50, &demangler).is_none());
        assert!(cache.find(0x110, &demangler).is_none());
        assert!(cache.find(0x220, &demangler).is_none());
    }

    #[test]
    fn zero_size_covers_the_tail() {
        let demangler = Demangler::new();
        let mut cache = cache();
        assert_eq!(cache.find(0x4000, &demangler).unwrap().name, "unbounded");
    }

    #[test]
    fn first_inserted_wins_on_equal_offsets() {
        let demangler = Demangler::new();
        let mut cache = cache();
        assert_eq!(cache.find(0x105, &demangler).unwrap().name, "first");
    }

    #[test]
    fn demangles_lazily() {
        let demangler = Demangler::new();
        let mut cache = SymbolCache::new(vec![SymbolEntry::new(
            0x10,
            0x10,
            "_ZN3foo3barEv".into(),
        )]);
        assert_eq!(cache.find(0x10, &demangler).unwrap().name, "foo::bar()");
        // second lookup returns the cached demangled form
        assert_eq!(cache.find(0x12, &demangler).unwrap().name, "foo::bar()");
    }
}
