use crate::mem::{frame_allocator::UserPool, frame_table::FrameEntry};
use alloc::boxed::Box;
use log::debug;

pub trait PageReplacementPolicy: Send {
    /// Picks the index of a frame to evict from `frames`, which is in
    /// allocation order. Returns `None` if nothing may be evicted.
    fn evict_page(&mut self, frames: &[FrameEntry], pool: &UserPool) -> Option<usize>;

    /// Called after `frames[index]` was removed from the table.
    fn removed(&mut self, index: usize);
}

/// Second chance: a frame whose accessed bit is set has the bit cleared and
/// is passed over once. The bit is read from the page directory of the frame's
/// own process, whichever process is asking for a frame.
pub struct ClockPolicy {
    hand: usize,
    passes: usize,
}

impl ClockPolicy {
    pub fn new(passes: usize) -> Self {
        Self { hand: 0, passes }
    }

    pub fn boxed(passes: usize) -> Box<dyn PageReplacementPolicy> {
        Box::new(Self::new(passes))
    }
}

impl PageReplacementPolicy for ClockPolicy {
    fn evict_page(&mut self, frames: &[FrameEntry], pool: &UserPool) -> Option<usize> {
        if frames.is_empty() {
            return None;
        }

        for _ in 0..self.passes * frames.len() {
            self.hand %= frames.len();
            let frame = &frames[self.hand];

            if !pool.is_pinned(frame.kpage) {
                let pagedir = frame.owner.pagedir();
                if !pagedir.is_accessed(frame.upage) {
                    debug!(
                        "evicting {:#x} of thread {} from {:?}",
                        frame.upage, frame.tid, frame.kpage
                    );
                    return Some(self.hand);
                }
                pagedir.set_accessed(frame.upage, false);
            }

            self.hand += 1;
        }

        None
    }

    fn removed(&mut self, index: usize) {
        // Keep the hand on the entry it pointed at; the victim's successor
        // slides into the victim's place.
        if index < self.hand {
            self.hand -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PageDirectory;
    use crate::test_util::{frame_entry, TestProcess};

    fn setup(n: usize) -> (TestProcess, UserPool, alloc::vec::Vec<FrameEntry>) {
        let process = TestProcess::new(1);
        let pool = UserPool::new(n);
        let frames = (0..n)
            .map(|i| frame_entry(&process, &pool, 0x1000_0000 + i * 0x1000))
            .collect();
        (process, pool, frames)
    }

    #[test]
    fn all_accessed_clears_then_picks_first() {
        let (process, pool, frames) = setup(3);
        for frame in &frames {
            process.pagedir.set_accessed(frame.upage, true);
        }

        let mut clock = ClockPolicy::new(2);
        assert_eq!(clock.evict_page(&frames, &pool), Some(0));
        assert!(frames
            .iter()
            .all(|frame| !process.pagedir.is_accessed(frame.upage)));
    }

    #[test]
    fn single_pass_is_not_enough_when_everything_was_accessed() {
        let (process, pool, frames) = setup(2);
        for frame in &frames {
            process.pagedir.set_accessed(frame.upage, true);
        }

        let mut clock = ClockPolicy::new(1);
        assert_eq!(clock.evict_page(&frames, &pool), None);
        assert_eq!(clock.evict_page(&frames, &pool), Some(0));
    }

    #[test]
    fn second_chance_skips_recently_used() {
        let (process, pool, frames) = setup(3);
        process.pagedir.set_accessed(frames[0].upage, true);

        let mut clock = ClockPolicy::new(2);
        assert_eq!(clock.evict_page(&frames, &pool), Some(1));
        assert!(!process.pagedir.is_accessed(frames[0].upage));
    }

    #[test]
    fn pinned_frames_are_never_chosen() {
        let (_process, pool, frames) = setup(2);
        for frame in &frames {
            pool.pin(frame.kpage);
        }

        let mut clock = ClockPolicy::new(2);
        assert_eq!(clock.evict_page(&frames, &pool), None);

        pool.unpin(frames[1].kpage);
        assert_eq!(clock.evict_page(&frames, &pool), Some(1));
    }

    #[test]
    fn hand_survives_removal() {
        let (_process, pool, mut frames) = setup(3);
        let mut clock = ClockPolicy::new(2);

        let victim = clock.evict_page(&frames, &pool).unwrap();
        frames.remove(victim);
        clock.removed(victim);

        // The scan resumes at the frame after the old victim.
        assert_eq!(clock.evict_page(&frames, &pool), Some(0));
        assert_eq!(frames[0].upage, 0x1000_1000);
    }

    #[test]
    fn empty_table_has_no_victim() {
        let pool = UserPool::new(1);
        assert_eq!(ClockPolicy::new(2).evict_page(&[], &pool), None);
    }
}
