use crate::config::BUF_NUM;
use crate::sd::{Block, BLOCK_SIZE};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectorTag {
    pub track: u8,
    pub sector: u8,
}

#[derive(Copy, Clone)]
pub struct SectorSlot {
    pub data: Block,
    pub tag: Option<SectorTag>,
}

const EMPTY_SLOT: SectorSlot = SectorSlot {
    data: [0; BLOCK_SIZE],
    tag: None,
};

/**
Fixed pool of sector-sized buffers.

While the drive runs, the slots stage captured data fields in round-robin
order until they are flushed as one batch. While mounting, the same memory
is borrowed as card I/O scratch space.
*/
pub struct BufferPool {
    slots: [SectorSlot; BUF_NUM],
    current: usize,
}

impl BufferPool {
    pub const fn new() -> Self {
        return BufferPool {
            slots: [EMPTY_SLOT; BUF_NUM],
            current: 0,
        };
    }

    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.data.fill(0);
            slot.tag = None;
        }
        self.current = 0;
    }

    pub fn current(&self) -> usize {
        return self.current;
    }

    pub fn slot(&self, index: usize) -> &SectorSlot {
        return &self.slots[index];
    }

    pub fn capture_buffer(&mut self) -> &mut Block {
        return &mut self.slots[self.current].data;
    }

    /**
    Tag the current slot and move on to the next one. Returns true when the
    tagged slot was the last free one; the caller must flush before
    capturing again.
    */
    pub fn commit(&mut self, tag: SectorTag) -> bool {
        self.slots[self.current].tag = Some(tag);
        if self.current == BUF_NUM - 1 {
            return true;
        }
        self.current += 1;
        return false;
    }

    pub fn is_empty(&self) -> bool {
        return self.slots.iter().all(|s| s.tag.is_none());
    }

    pub fn staged(&self) -> impl Iterator<Item = (&Block, SectorTag)> + '_ {
        return self.slots.iter().filter_map(|s| s.tag.map(|tag| (&s.data, tag)));
    }

    /// True when reading `track`/`sector` must wait for a flush: a slot
    /// holds that very sector, or holds a sector of another track.
    pub fn collides(&self, track: u8, sector: u8) -> bool {
        return self.slots.iter().filter_map(|s| s.tag).any(|tag| {
            return tag.track != track || tag.sector == sector;
        });
    }

    pub fn release(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.tag = None;
        }
        self.current = 0;
    }

    /// Two scratch blocks for card I/O. Only valid while nothing is staged.
    pub fn scratch_pair(&mut self) -> (&mut Block, &mut Block) {
        let (first, rest) = self.slots.split_at_mut(1);
        return (&mut first[0].data, &mut rest[0].data);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        return Self::new();
    }
}

#[cfg(test)]
mod test_buffers {
    use super::*;

    fn tag(track: u8, sector: u8) -> SectorTag {
        return SectorTag { track, sector };
    }

    #[test]
    pub fn test_commit_round_robin_until_full() {
        let mut pool = BufferPool::new();
        assert!(pool.is_empty());
        for i in 0..BUF_NUM - 1 {
            pool.capture_buffer()[0] = i as u8;
            assert!(!pool.commit(tag(3, i as u8)));
            assert_eq!(pool.current(), i + 1);
        }
        assert!(pool.commit(tag(3, 9)));
        assert_eq!(pool.current(), BUF_NUM - 1);
        assert_eq!(pool.staged().count(), BUF_NUM);
        assert_eq!(pool.slot(2).data[0], 2);
    }

    #[test]
    pub fn test_release_empties_pool() {
        let mut pool = BufferPool::new();
        pool.commit(tag(1, 1));
        pool.commit(tag(1, 2));
        pool.release();
        assert!(pool.is_empty());
        assert_eq!(pool.current(), 0);
        assert_eq!(pool.staged().count(), 0);
    }

    #[test]
    pub fn test_collision_rule() {
        let mut pool = BufferPool::new();
        assert!(!pool.collides(0, 0));
        pool.commit(tag(5, 3));
        assert!(pool.collides(5, 3));
        assert!(!pool.collides(5, 4));
        assert!(pool.collides(6, 4));
    }

    #[test]
    pub fn test_scratch_pair_is_disjoint() {
        let mut pool = BufferPool::new();
        let (a, b) = pool.scratch_pair();
        a.fill(0x11);
        b.fill(0x22);
        assert_eq!(pool.slot(0).data[511], 0x11);
        assert_eq!(pool.slot(1).data[0], 0x22);
        pool.clear();
        assert_eq!(pool.slot(0).data[511], 0);
    }
}
