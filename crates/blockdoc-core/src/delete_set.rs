//! Compact per-client sets of deleted clock ranges.

use crate::codec::{CodecError, Reader, Writer};
use crate::id::Id;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteRange {
    pub clock: u32,
    pub len: u32,
}

impl DeleteRange {
    pub fn end(&self) -> u32 {
        self.clock + self.len
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSet {
    clients: HashMap<u32, Vec<DeleteRange>>,
}

impl DeleteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.values().all(|ranges| ranges.is_empty())
    }

    pub fn add(&mut self, id: Id, len: u32) {
        self.clients
            .entry(id.client)
            .or_default()
            .push(DeleteRange {
                clock: id.clock,
                len,
            });
    }

    pub fn clients(&self) -> impl Iterator<Item = (u32, &[DeleteRange])> {
        self.clients
            .iter()
            .map(|(client, ranges)| (*client, ranges.as_slice()))
    }

    pub fn ranges(&self, client: u32) -> &[DeleteRange] {
        self.clients
            .get(&client)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sort each client's ranges ascending by clock and coalesce overlapping
    /// or adjacent ranges. Afterwards ranges are non-overlapping.
    pub fn sort_and_merge(&mut self) {
        for ranges in self.clients.values_mut() {
            ranges.sort_by_key(|r| r.clock);
            let mut merged: Vec<DeleteRange> = Vec::with_capacity(ranges.len());
            for range in ranges.iter().copied() {
                match merged.last_mut() {
                    Some(last) if range.clock <= last.end() => {
                        let end = last.end().max(range.end());
                        last.len = end - last.clock;
                    }
                    _ => merged.push(range),
                }
            }
            *ranges = merged;
        }
        self.clients.retain(|_, ranges| !ranges.is_empty());
    }

    /// Membership test; requires `sort_and_merge` to have run for binary
    /// search to be valid.
    pub fn is_deleted(&self, id: Id) -> bool {
        let Some(ranges) = self.clients.get(&id.client) else {
            return false;
        };
        let idx = match ranges.binary_search_by_key(&id.clock, |r| r.clock) {
            Ok(i) => i,
            Err(0) => return false,
            Err(i) => i - 1,
        };
        id.clock < ranges[idx].end()
    }

    pub fn merge(&mut self, other: &DeleteSet) {
        for (client, ranges) in &other.clients {
            self.clients
                .entry(*client)
                .or_default()
                .extend_from_slice(ranges);
        }
        self.sort_and_merge();
    }

    pub fn write(&self, w: &mut Writer) {
        let mut clients: Vec<u32> = self.clients.keys().copied().collect();
        clients.sort_unstable();
        w.write_var_u32(clients.len() as u32);
        for client in clients {
            let ranges = &self.clients[&client];
            w.write_var_u32(client);
            w.write_var_u32(ranges.len() as u32);
            for range in ranges {
                w.write_var_u32(range.clock);
                w.write_var_u32(range.len);
            }
        }
    }

    pub fn read(r: &mut Reader<'_>) -> Result<DeleteSet, CodecError> {
        let mut ds = DeleteSet::new();
        let num_clients = r.read_var_u32()?;
        for _ in 0..num_clients {
            let client = r.read_var_u32()?;
            let num_ranges = r.read_var_u32()?;
            let ranges = ds.clients.entry(client).or_default();
            for _ in 0..num_ranges {
                let clock = r.read_var_u32()?;
                let len = r.read_var_u32()?;
                ranges.push(DeleteRange { clock, len });
            }
        }
        Ok(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_and_merge_coalesces() {
        let mut ds = DeleteSet::new();
        ds.add(Id::new(1, 10), 5);
        ds.add(Id::new(1, 0), 4);
        ds.add(Id::new(1, 4), 6);
        ds.sort_and_merge();
        assert_eq!(
            ds.ranges(1),
            &[DeleteRange { clock: 0, len: 15 }]
        );
    }

    #[test]
    fn membership_after_merge() {
        let mut ds = DeleteSet::new();
        ds.add(Id::new(2, 5), 3);
        ds.add(Id::new(2, 20), 1);
        ds.sort_and_merge();
        assert!(ds.is_deleted(Id::new(2, 5)));
        assert!(ds.is_deleted(Id::new(2, 7)));
        assert!(!ds.is_deleted(Id::new(2, 8)));
        assert!(ds.is_deleted(Id::new(2, 20)));
        assert!(!ds.is_deleted(Id::new(3, 5)));
    }

    #[test]
    fn codec_roundtrip() {
        let mut ds = DeleteSet::new();
        ds.add(Id::new(1, 0), 2);
        ds.add(Id::new(9, 100), 50);
        ds.sort_and_merge();

        let mut w = Writer::new();
        ds.write(&mut w);
        let buf = w.into_inner();
        let decoded = DeleteSet::read(&mut Reader::new(&buf)).unwrap();
        assert_eq!(decoded, ds);
    }
}
