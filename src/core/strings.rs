//! Insertion-ordered string pool mapping strings to dense 1-based indices.

use std::collections::HashMap;

use crate::core::types::StringIndex;

#[derive(Default)]
pub struct Interner {
    strings: Vec<String>,
    indices: HashMap<String, StringIndex>,
}

impl Interner {
    pub fn new() -> Interner {
        Interner::default()
    }

    /// Returns the existing index for `s`, or appends it. The empty string
    /// maps to index 0 without insertion.
    pub fn intern(&mut self, s: &str) -> StringIndex {
        if s.is_empty() {
            return StringIndex(0);
        }
        if let Some(&index) = self.indices.get(s) {
            return index;
        }
        self.push(s.to_owned())
    }

    /// Appends `s` unconditionally, keeping index numbering aligned with a
    /// stream producer that already deduplicated its pool.
    pub fn add(&mut self, s: &str) -> StringIndex {
        let index = StringIndex(self.strings.len() as u32 + 1);
        self.strings.push(s.to_owned());
        self.indices.entry(s.to_owned()).or_insert(index);
        index
    }

    /// Resolves an index; 0 and out-of-range indices yield "".
    pub fn get(&self, index: StringIndex) -> &str {
        if !index.is_valid() {
            return "";
        }
        self.strings
            .get(index.0 as usize - 1)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }

    fn push(&mut self, s: String) -> StringIndex {
        let index = StringIndex(self.strings.len() as u32 + 1);
        self.indices.insert(s.clone(), index);
        self.strings.push(s);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_unique() {
        let mut pool = Interner::new();
        let a = pool.intern("malloc");
        let b = pool.intern("operator new");
        assert_eq!(a, StringIndex(1));
        assert_eq!(b, StringIndex(2));
        assert_eq!(pool.intern("malloc"), a);
        assert_ne!(pool.intern("operator new"), a);
        assert_eq!(pool.get(a), "malloc");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn empty_string_is_absent() {
        let mut pool = Interner::new();
        assert_eq!(pool.intern(""), StringIndex(0));
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.get(StringIndex(0)), "");
    }

    #[test]
    fn add_keeps_producer_numbering() {
        let mut pool = Interner::new();
        pool.add("main");
        pool.add("main");
        // duplicates from the stream still occupy their slot
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(StringIndex(2)), "main");
        // lookups resolve to the first occurrence
        assert_eq!(pool.intern("main"), StringIndex(1));
    }

    #[test]
    fn out_of_range_resolves_empty() {
        let pool = Interner::new();
        assert_eq!(pool.get(StringIndex(42)), "");
    }
}
