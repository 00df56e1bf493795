//! Allocation-size histogram, exported as `size\tcount` TSV ordered by
//! size.

use std::collections::BTreeMap;
use std::io::{self, Write};

#[derive(Default)]
pub struct Histogram {
    counts: BTreeMap<u64, u64>,
}

impl Histogram {
    pub fn new() -> Histogram {
        Histogram::default()
    }

    pub fn add(&mut self, size: u64) {
        *self.counts.entry(size).or_insert(0) += 1;
    }

    pub fn write(&self, w: &mut dyn Write) -> io::Result<()> {
        for (size, count) in &self.counts {
            writeln!(w, "{}\t{}", size, count)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_size() {
        let mut histogram = Histogram::new();
        histogram.add(32);
        histogram.add(16);
        histogram.add(32);
        histogram.add(4096);

        let mut out = Vec::new();
        histogram.write(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "16\t1\n32\t2\n4096\t1\n");
    }

    #[test]
    fn empty_histogram_writes_nothing() {
        let histogram = Histogram::new();
        let mut out = Vec::new();
        histogram.write(&mut out).unwrap();
        assert!(out.is_empty());
        assert!(histogram.is_empty());
    }
}
