//! A priority merge over several sorted `(key, Rid)` sources: the C++ side
//! composes `HeapIterator`/`TwoMergeIterator` pairwise; this port collapses
//! that into one N-way merge since `itertools` already gives us the
//! peekable building block and the source count here is always small
//! (a handful of frozen tables plus one SSTable per relevant level).
//!
//! Sources must be passed newest-first: on a duplicate key, the source with
//! the lowest index wins and every other source holding that key is
//! advanced past it, so a shadowed value is never yielded.

use std::cmp::Ordering;
use std::convert::TryInto;

use crate::column::{compare_key, ColumnDescriptor};
use crate::error::StorageResult;
use crate::rid::Rid;

pub struct MergeIterator<I: Iterator<Item = StorageResult<(Vec<u8>, Rid)>>> {
    sources: Vec<std::iter::Peekable<I>>,
    cols: Vec<ColumnDescriptor>,
    include_tombstones: bool,
}

impl<I: Iterator<Item = StorageResult<(Vec<u8>, Rid)>>> MergeIterator<I> {
    pub fn new(sources: Vec<I>, cols: Vec<ColumnDescriptor>, include_tombstones: bool) -> Self {
        MergeIterator {
            sources: sources.into_iter().map(|s| s.peekable()).collect(),
            cols,
            include_tombstones,
        }
    }
}

impl<I: Iterator<Item = StorageResult<(Vec<u8>, Rid)>>> Iterator for MergeIterator<I> {
    type Item = StorageResult<(Vec<u8>, Rid)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut best: Option<(usize, Vec<u8>)> = None;
            for (i, src) in self.sources.iter_mut().enumerate() {
                match src.peek() {
                    Some(Ok((k, _))) => {
                        let better = match &best {
                            None => true,
                            Some((_, bk)) => compare_key(k, bk, &self.cols) == Ordering::Less,
                        };
                        if better {
                            best = Some((i, k.clone()));
                        }
                    }
                    Some(Err(_)) => return self.sources[i].next(),
                    None => {}
                }
            }
            let (best_idx, best_key) = best?;

            let mut winner_rid = None;
            for (i, src) in self.sources.iter_mut().enumerate() {
                if let Some(Ok((k, rid))) = src.peek() {
                    if compare_key(k, &best_key, &self.cols) == Ordering::Equal {
                        if i == best_idx {
                            winner_rid = Some(*rid);
                        }
                        src.next();
                    }
                }
            }
            let rid = winner_rid.expect("best source must have held the winning key");
            if !self.include_tombstones && !rid.is_valid() {
                continue;
            }
            return Some(Ok((best_key, rid)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::ColumnDescriptor;

    fn cols() -> Vec<ColumnDescriptor> {
        vec![ColumnDescriptor::int()]
    }

    fn src(pairs: &[(i32, i32)]) -> impl Iterator<Item = StorageResult<(Vec<u8>, Rid)>> {
        pairs
            .iter()
            .map(|&(k, v)| Ok((k.to_be_bytes().to_vec(), Rid::new(v, 0))))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn merges_disjoint_sources_in_key_order() {
        let a = src(&[(1, 1), (3, 3)]);
        let b = src(&[(2, 2), (4, 4)]);
        let merged = MergeIterator::new(vec![a, b], cols(), true);
        let got: Vec<i32> = merged.map(|r| r.unwrap().1.page_no).collect();
        assert_eq!(got, vec![1, 2, 3, 4]);
    }

    #[test]
    fn newest_source_wins_on_duplicate_key() {
        let newest = src(&[(1, 100)]);
        let older = src(&[(1, 1)]);
        let merged = MergeIterator::new(vec![newest, older], cols(), true);
        let got: Vec<(i32, i32)> = merged
            .map(|r| {
                let (k, v) = r.unwrap();
                (i32::from_be_bytes(k.try_into().unwrap()), v.page_no)
            })
            .collect();
        assert_eq!(got, vec![(1, 100)]);
    }

    #[test]
    fn tombstones_dropped_when_excluded() {
        let newest = src(&[(1, -1)]);
        let merged = MergeIterator::new(vec![newest], cols(), false);
        assert_eq!(merged.count(), 0);
    }
}
