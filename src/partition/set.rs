//! Cache-partition set: the way-allocation bookkeeping LFOC clustering sits
//! on top of (spec §4.J "Partition-set operations").
//!
//! Partitions are kept in an ordered list whose way counts always sum to
//! `nr_ways`; partition `i` owns the half-open way range
//! `[sum(ways[..i]), sum(ways[..=i]))`. CAT masks (contiguous bit ranges)
//! are derived from that ordering rather than stored separately, since a
//! valid CBM is always contiguous.

use rand::Rng;

use crate::error::{PmcError, PmcResult};

pub type PartitionId = u32;
pub type AppId = u32;

#[derive(Clone, Debug)]
pub struct Partition {
    pub id: PartitionId,
    pub ways: u8,
    pub apps: Vec<AppId>,
}

/// Ordered collection of cache partitions spanning `nr_ways` total ways
/// (spec §4.J).
pub struct PartitionSet {
    nr_ways: u8,
    partitions: Vec<Partition>,
    next_id: PartitionId,
}

impl PartitionSet {
    pub fn new(nr_ways: u8) -> Self {
        PartitionSet {
            nr_ways,
            partitions: Vec::new(),
            next_id: 0,
        }
    }

    pub fn nr_ways(&self) -> u8 {
        self.nr_ways
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.id == id)
    }

    fn index_of(&self, id: PartitionId) -> Option<usize> {
        self.partitions.iter().position(|p| p.id == id)
    }

    /// The capacity bitmask for `id`, derived from its position among the
    /// other partitions.
    pub fn mask_of(&self, id: PartitionId) -> Option<u32> {
        let idx = self.index_of(id)?;
        let start: u8 = self.partitions[..idx].iter().map(|p| p.ways).sum();
        let ways = self.partitions[idx].ways;
        Some(ways_to_mask(start, ways))
    }

    fn total_assigned(&self) -> u8 {
        self.partitions.iter().map(|p| p.ways).sum()
    }

    /// Inserts a new, empty partition, sized by fair-share redistribution
    /// (spec §4.J "allocate"). `hint` names a preferred gap index (the
    /// position to insert after); out-of-range hints fall back to the
    /// computed "suitable gap".
    pub fn allocate(&mut self, hint: Option<usize>) -> PmcResult<PartitionId> {
        let old_count = self.partitions.len();
        let id = self.next_id;
        self.next_id += 1;

        if old_count == 0 {
            self.partitions.push(Partition {
                id,
                ways: self.nr_ways,
                apps: Vec::new(),
            });
            return Ok(id);
        }

        let fair = self.nr_ways / (old_count as u8 + 1);
        let gap = if old_count == 1 {
            0
        } else {
            hint.filter(|&h| h < old_count - 1)
                .unwrap_or_else(|| self.suitable_gap(fair))
        };

        self.partitions.insert(
            gap + 1,
            Partition {
                id,
                ways: fair,
                apps: Vec::new(),
            },
        );
        self.redistribute_from(gap + 1, fair);
        Ok(id)
    }

    /// Picks the gap (index `i` means "between partitions `i` and `i+1`")
    /// whose endpoints deviate most from the fair share — those
    /// partitions have the most slack to give up (spec §4.J). Ties break
    /// randomly, per spec.
    fn suitable_gap(&self, fair: u8) -> usize {
        let deviation = |p: &Partition| (p.ways as i32 - fair as i32).unsigned_abs();
        let mut best = 0usize;
        let mut best_score = 0u32;
        let mut ties = Vec::new();
        for i in 0..self.partitions.len() - 1 {
            let score = deviation(&self.partitions[i]) + deviation(&self.partitions[i + 1]);
            match score.cmp(&best_score) {
                std::cmp::Ordering::Greater => {
                    best_score = score;
                    best = i;
                    ties.clear();
                    ties.push(i);
                }
                std::cmp::Ordering::Equal => ties.push(i),
                std::cmp::Ordering::Less => {}
            }
        }
        if ties.len() > 1 {
            ties[rand::thread_rng().gen_range(0..ties.len())]
        } else {
            best
        }
    }

    /// Gives every partition the fair share, then hands out the remainder
    /// one way at a time, starting from the partitions adjacent to
    /// `inserted_at` (up to 2 extra ways between them) and then outward
    /// (spec §4.J "redistribute ways").
    fn redistribute_from(&mut self, inserted_at: usize, fair: u8) {
        let n = self.partitions.len();
        for p in self.partitions.iter_mut() {
            p.ways = fair;
        }
        let mut remaining = self.nr_ways as i32 - fair as i32 * n as i32;

        let mut left = inserted_at as i32 - 1;
        let mut right = inserted_at as i32 + 1;
        let mut neighbor_extra = 0;
        while remaining > 0 && neighbor_extra < 2 && (left >= 0 || right < n as i32) {
            if right < n as i32 && remaining > 0 {
                self.partitions[right as usize].ways += 1;
                remaining -= 1;
                neighbor_extra += 1;
            }
            if left >= 0 && remaining > 0 && neighbor_extra < 2 {
                self.partitions[left as usize].ways += 1;
                remaining -= 1;
                neighbor_extra += 1;
            }
            left -= 1;
            right += 1;
        }

        let mut idx = 0;
        while remaining > 0 {
            self.partitions[idx % n].ways += 1;
            remaining -= 1;
            idx += 1;
        }
    }

    /// Removes `id`, redistributing its ways to the rest of the set
    /// symmetrically with `allocate` (spec §4.J "deallocate").
    pub fn deallocate(&mut self, id: PartitionId) -> PmcResult<()> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| PmcError::ConfigRejected(format!("no such partition {id}")))?;
        let nr_old_partitions = self.partitions.len();
        if nr_old_partitions <= 1 {
            self.partitions.remove(idx);
            return Ok(());
        }

        let fair = self.nr_ways / (nr_old_partitions as u8 - 1);
        self.partitions.remove(idx);

        // Resolved open question: the upstream implementation's gap
        // direction test is `gap_id <= nr_old_partitions / 2`, not `/ 2`
        // of the *new* count — confirmed against
        // `original_source/src/modules/pmcs/cache_part_set.c`.
        let ascending = idx <= nr_old_partitions / 2;
        let n = self.partitions.len();
        for p in self.partitions.iter_mut() {
            p.ways = fair;
        }
        let mut remaining = self.nr_ways as i32 - fair as i32 * n as i32;

        if ascending {
            let mut i = idx.min(n.saturating_sub(1));
            while remaining > 0 && n > 0 {
                self.partitions[i].ways += 1;
                remaining -= 1;
                i = (i + 1) % n;
            }
        } else {
            let mut i = idx.saturating_sub(1).min(n.saturating_sub(1));
            while remaining > 0 && n > 0 {
                self.partitions[i].ways += 1;
                remaining -= 1;
                i = if i == 0 { n - 1 } else { i - 1 };
            }
        }
        Ok(())
    }

    /// Scans for partitions with no assigned apps, deallocating each (with
    /// rebalancing) when `auto_resize` is set, or dropping them in place
    /// otherwise (spec §4.J "remove_empty_partitions").
    pub fn remove_empty_partitions(&mut self, auto_resize: bool) {
        let empty: Vec<PartitionId> = self
            .partitions
            .iter()
            .filter(|p| p.apps.is_empty())
            .map(|p| p.id)
            .collect();
        for id in empty {
            if auto_resize {
                let _ = self.deallocate(id);
            } else if let Some(idx) = self.index_of(id) {
                self.partitions.remove(idx);
            }
        }
    }

    pub fn move_app(&mut self, app: AppId, from: PartitionId, to: PartitionId) -> PmcResult<()> {
        let from_idx = self
            .index_of(from)
            .ok_or_else(|| PmcError::ConfigRejected(format!("no such partition {from}")))?;
        self.partitions[from_idx].apps.retain(|&a| a != app);
        let to_idx = self
            .index_of(to)
            .ok_or_else(|| PmcError::ConfigRejected(format!("no such partition {to}")))?;
        self.partitions[to_idx].apps.push(app);
        Ok(())
    }
}

fn ways_to_mask(start: u8, ways: u8) -> u32 {
    if ways == 0 {
        return 0;
    }
    let bits = if ways >= 32 { u32::MAX } else { (1u32 << ways) - 1 };
    bits << start
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_allocation_gets_all_ways() {
        let mut set = PartitionSet::new(20);
        let id = set.allocate(None).unwrap();
        assert_eq!(set.partition(id).unwrap().ways, 20);
    }

    #[test]
    fn allocation_conserves_total_ways() {
        let mut set = PartitionSet::new(20);
        for _ in 0..4 {
            set.allocate(None).unwrap();
        }
        let total: u8 = set.partitions().iter().map(|p| p.ways).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn deallocation_conserves_total_ways_and_removes_partition() {
        let mut set = PartitionSet::new(20);
        let ids: Vec<_> = (0..4).map(|_| set.allocate(None).unwrap()).collect();
        set.deallocate(ids[1]).unwrap();
        assert!(set.partition(ids[1]).is_none());
        let total: u8 = set.partitions().iter().map(|p| p.ways).sum();
        assert_eq!(total, 20);
        assert_eq!(set.partitions().len(), 3);
    }

    #[test]
    fn masks_are_contiguous_and_non_overlapping() {
        let mut set = PartitionSet::new(20);
        for _ in 0..3 {
            set.allocate(None).unwrap();
        }
        let mut union = 0u32;
        for p in set.partitions() {
            let mask = set.mask_of(p.id).unwrap();
            assert_eq!(union & mask, 0, "partition masks must not overlap");
            union |= mask;
        }
        assert_eq!(union, (1u32 << 20) - 1);
    }

    #[test]
    fn swept_seeds_preserve_the_partition_set_invariant() {
        use crate::testutil::SplitMix64;
        for seed in [11u64, 202, 3001, 55555] {
            let mut rng = SplitMix64::new(seed);
            let mut set = PartitionSet::new(20);
            let mut live: Vec<PartitionId> = Vec::new();
            for _ in 0..100 {
                if live.is_empty() || (live.len() < 10 && rng.next_range(2) == 0) {
                    live.push(set.allocate(None).unwrap());
                } else {
                    let idx = rng.next_range(live.len() as u64) as usize;
                    let id = live.remove(idx);
                    set.deallocate(id).unwrap();
                }

                let total: u8 = set.partitions().iter().map(|p| p.ways).sum();
                assert_eq!(total, 20, "seed {seed}: ways must sum to nr_ways");

                let mut union = 0u32;
                let mut prev_start = -1i64;
                for p in set.partitions() {
                    let mask = set.mask_of(p.id).unwrap();
                    assert_eq!(union & mask, 0, "seed {seed}: partitions must not overlap");
                    let start = mask.trailing_zeros() as i64;
                    assert!(start > prev_start, "seed {seed}: partitions must be ordered by low_way");
                    prev_start = start;
                    union |= mask;
                }
                assert_eq!(union, (1u32 << 20) - 1, "seed {seed}: partitions must cover every way");
            }
        }
    }

    #[test]
    fn remove_empty_partitions_with_auto_resize_rebalances() {
        let mut set = PartitionSet::new(20);
        let ids: Vec<_> = (0..3).map(|_| set.allocate(None).unwrap()).collect();
        set.partitions
            .iter_mut()
            .find(|p| p.id == ids[0])
            .unwrap()
            .apps
            .push(1);
        set.remove_empty_partitions(true);
        assert_eq!(set.partitions().len(), 1);
        let total: u8 = set.partitions().iter().map(|p| p.ways).sum();
        assert_eq!(total, 20);
    }
}
