//! External-memory sorter for `$orderby` queries no index can satisfy.
//!
//! Matched documents accumulate as raw BSON in a heap region; past the
//! high-water mark the region migrates to an anonymous temp file
//! (unlinked on creation) that is memory-mapped for the drain phase.
//! Sort keys are extracted once on insert, so comparisons never reparse
//! spilled documents.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};

use bson::{Bson, Document};
use chert_query::OrderKey;
use chert_query::value::cmp_values;
use memmap2::Mmap;

use crate::error::DbError;
use crate::ids::DocId;

struct RecordRef {
    offset: u64,
    len: u32,
    id: DocId,
    sort_keys: Vec<Option<Bson>>,
}

pub(crate) struct Sorter {
    directions: Vec<bool>,
    order_paths: Vec<chert_query::Path>,
    high_water: usize,
    docs: Vec<u8>,
    spill: Option<BufWriter<File>>,
    spill_len: u64,
    refs: Vec<RecordRef>,
}

impl Sorter {
    pub fn new(order: &[OrderKey], high_water: usize) -> Self {
        Self {
            directions: order.iter().map(|k| k.descending).collect(),
            order_paths: order.iter().map(|k| k.path.clone()).collect(),
            high_water,
            docs: Vec::new(),
            spill: None,
            spill_len: 0,
            refs: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Buffer one matched document. `doc` is the parsed form of `bytes`
    /// and is only read for its sort-key values.
    pub fn add(&mut self, id: DocId, doc: &Document, bytes: &[u8]) -> Result<(), DbError> {
        let sort_keys = self
            .order_paths
            .iter()
            .map(|p| p.resolve_first(doc).cloned())
            .collect();

        let offset = match &mut self.spill {
            Some(writer) => {
                let offset = self.spill_len;
                writer.write_all(bytes)?;
                self.spill_len += bytes.len() as u64;
                offset
            }
            None if self.docs.len() + bytes.len() > self.high_water => {
                // Migrate the heap region to an anonymous temp file.
                let file = tempfile::tempfile()?;
                let mut writer = BufWriter::new(file);
                writer.write_all(&self.docs)?;
                let offset = self.docs.len() as u64;
                writer.write_all(bytes)?;
                self.spill_len = offset + bytes.len() as u64;
                self.spill = Some(writer);
                self.docs = Vec::new();
                offset
            }
            None => {
                let offset = self.docs.len() as u64;
                self.docs.extend_from_slice(bytes);
                offset
            }
        };

        self.refs.push(RecordRef {
            offset,
            len: bytes.len() as u32,
            id,
            sort_keys,
        });
        Ok(())
    }

    fn compare(&self, a: &RecordRef, b: &RecordRef) -> Ordering {
        for (i, descending) in self.directions.iter().enumerate() {
            let ord = match (&a.sort_keys[i], &b.sort_keys[i]) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => cmp_values(x, y),
            };
            let ord = if *descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Sort and deliver buffered documents from `skip` onward. The
    /// callback returns a step; zero stops the drain.
    pub fn drain(
        &mut self,
        skip: u64,
        mut visit: impl FnMut(&DocId, Document) -> Result<i64, DbError>,
    ) -> Result<(), DbError> {
        if self.refs.is_empty() {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..self.refs.len()).collect();
        order.sort_by(|&a, &b| self.compare(&self.refs[a], &self.refs[b]));

        let mapped;
        let region: &[u8] = match &mut self.spill {
            Some(writer) => {
                writer.flush()?;
                let file = writer.get_mut();
                file.seek(SeekFrom::Start(0))?;
                // The file is a private unlinked temp file created and
                // written only by this sorter.
                mapped = unsafe { Mmap::map(&*file)? };
                &mapped
            }
            None => &self.docs,
        };

        let mut pos = skip as i64;
        while pos >= 0 && (pos as usize) < order.len() {
            let r = &self.refs[order[pos as usize]];
            let start = r.offset as usize;
            let bytes = &region[start..start + r.len as usize];
            let doc: Document = bson::deserialize_from_slice(bytes)?;
            let step = visit(&r.id, doc)?;
            if step == 0 {
                break;
            }
            pos += step;
        }
        Ok(())
    }

    /// True when the sorter migrated to a spill file.
    #[cfg(test)]
    pub fn spilled(&self) -> bool {
        self.spill.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use chert_query::Path;

    fn order(path: &str, descending: bool) -> OrderKey {
        OrderKey {
            path: Path::parse(path),
            descending,
        }
    }

    fn encode(doc: &Document) -> Vec<u8> {
        bson::serialize_to_vec(doc).unwrap()
    }

    fn collect(sorter: &mut Sorter, skip: u64) -> Vec<(DocId, Document)> {
        let mut out = Vec::new();
        sorter
            .drain(skip, |id, doc| {
                out.push((id.clone(), doc));
                Ok(1)
            })
            .unwrap();
        out
    }

    #[test]
    fn sorts_by_single_key() {
        let mut sorter = Sorter::new(&[order("name", false)], 1 << 20);
        for (i, name) in ["Anton", "Ada", "John"].iter().enumerate() {
            let d = doc! { "name": *name };
            sorter.add(DocId::I64(i as i64), &d, &encode(&d)).unwrap();
        }
        let names: Vec<String> = collect(&mut sorter, 0)
            .into_iter()
            .map(|(_, d)| d.get_str("name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["Ada", "Anton", "John"]);
    }

    #[test]
    fn descending_and_secondary_key() {
        let mut sorter = Sorter::new(&[order("g", true), order("n", false)], 1 << 20);
        let rows = [(1, 5), (2, 3), (1, 2), (2, 9)];
        for (i, (g, n)) in rows.iter().enumerate() {
            let d = doc! { "g": *g, "n": *n };
            sorter.add(DocId::I64(i as i64), &d, &encode(&d)).unwrap();
        }
        let pairs: Vec<(i32, i32)> = collect(&mut sorter, 0)
            .into_iter()
            .map(|(_, d)| (d.get_i32("g").unwrap(), d.get_i32("n").unwrap()))
            .collect();
        assert_eq!(pairs, vec![(2, 3), (2, 9), (1, 2), (1, 5)]);
    }

    #[test]
    fn missing_sort_key_orders_first() {
        let mut sorter = Sorter::new(&[order("k", false)], 1 << 20);
        let with = doc! { "k": 1 };
        let without = doc! { "other": 1 };
        sorter.add(DocId::I64(1), &with, &encode(&with)).unwrap();
        sorter
            .add(DocId::I64(2), &without, &encode(&without))
            .unwrap();
        let ids: Vec<DocId> = collect(&mut sorter, 0).into_iter().map(|(i, _)| i).collect();
        assert_eq!(ids, vec![DocId::I64(2), DocId::I64(1)]);
    }

    #[test]
    fn skip_offsets_into_sorted_order() {
        let mut sorter = Sorter::new(&[order("n", false)], 1 << 20);
        for n in [3, 1, 2] {
            let d = doc! { "n": n };
            sorter.add(DocId::I64(n as i64), &d, &encode(&d)).unwrap();
        }
        let ns: Vec<i32> = collect(&mut sorter, 1)
            .into_iter()
            .map(|(_, d)| d.get_i32("n").unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3]);
    }

    #[test]
    fn empty_sorter_drains_nothing_without_spill() {
        let mut sorter = Sorter::new(&[order("n", false)], 1 << 20);
        assert_eq!(collect(&mut sorter, 0).len(), 0);
        assert!(!sorter.spilled());
    }

    #[test]
    fn spills_past_high_water_and_still_sorts() {
        // Tiny high-water mark forces the migration path.
        let mut sorter = Sorter::new(&[order("n", false)], 64);
        let mut expect: Vec<i32> = Vec::new();
        for n in (0..50).rev() {
            let d = doc! { "n": n, "pad": "x".repeat(32) };
            sorter.add(DocId::I64(n as i64), &d, &encode(&d)).unwrap();
            expect.push(n);
        }
        expect.sort();
        assert!(sorter.spilled());
        let ns: Vec<i32> = collect(&mut sorter, 0)
            .into_iter()
            .map(|(_, d)| d.get_i32("n").unwrap())
            .collect();
        assert_eq!(ns, expect);
    }

    #[test]
    fn drain_stops_on_zero_step() {
        let mut sorter = Sorter::new(&[order("n", false)], 1 << 20);
        for n in 0..10 {
            let d = doc! { "n": n };
            sorter.add(DocId::I64(n as i64), &d, &encode(&d)).unwrap();
        }
        let mut seen = 0;
        sorter
            .drain(0, |_, _| {
                seen += 1;
                Ok(if seen == 3 { 0 } else { 1 })
            })
            .unwrap();
        assert_eq!(seen, 3);
    }
}
