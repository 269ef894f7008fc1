//! Free-run tracking for one heap of 32 sub-blocks.
//!
//! `free_blocks[0]` has bit `i` set when unit `i` is free. Each following
//! mask is folded from the previous one, so bit `i` of `free_blocks[k]` is
//! set exactly when a free run of `k + 1` units starts at unit `i`. Finding
//! the lowest offset that fits `n` units is then a single `trailing_zeros`.

/// Units per heap.
pub const NUM_SUB_BLOCKS: u32 = 32;

#[derive(Debug)]
pub struct FreeBlockTracker {
    free_blocks: [u32; NUM_SUB_BLOCKS as usize],
    longest_run: u32,
    occupied: u32,
}

impl Default for FreeBlockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeBlockTracker {
    /// Fully free tracker.
    #[must_use]
    pub fn new() -> Self {
        let mut tracker = Self {
            free_blocks: [0; NUM_SUB_BLOCKS as usize],
            longest_run: 0,
            occupied: 0,
        };
        tracker.free_blocks[0] = u32::MAX;
        tracker.update_longest_run();
        tracker
    }

    #[inline]
    #[must_use]
    pub fn full(&self) -> bool {
        self.free_blocks[0] == 0
    }

    #[inline]
    #[must_use]
    pub fn empty(&self) -> bool {
        self.free_blocks[0] == u32::MAX
    }

    #[inline]
    #[must_use]
    pub fn longest_run(&self) -> u32 {
        self.longest_run
    }

    /// Occupied unit count.
    #[inline]
    #[must_use]
    pub fn occupied(&self) -> u32 {
        self.occupied
    }

    /// Bit `i` set when unit `i` is free.
    #[inline]
    #[must_use]
    pub fn free_mask(&self) -> u32 {
        self.free_blocks[0]
    }

    /// Mask of run starts for runs of `len` units (`1..=32`).
    #[inline]
    #[must_use]
    pub fn run_mask(&self, len: u32) -> u32 {
        debug_assert!((1..=NUM_SUB_BLOCKS).contains(&len));
        self.free_blocks[(len - 1) as usize]
    }

    /// Occupy the lowest run of `num_blocks` units. Returns the occupancy
    /// mask and the first unit.
    ///
    /// # Panics
    ///
    /// Panics if `num_blocks` is zero or exceeds [`longest_run`](Self::longest_run).
    pub fn allocate(&mut self, num_blocks: u32) -> (u32, u32) {
        assert!(
            num_blocks >= 1 && num_blocks <= self.longest_run,
            "allocate({num_blocks}) with longest free run {}",
            self.longest_run
        );

        let first = self.free_blocks[(num_blocks - 1) as usize].trailing_zeros();
        let mask = (u32::MAX >> (NUM_SUB_BLOCKS - num_blocks)) << first;
        debug_assert_eq!(self.free_blocks[0] & mask, mask);

        self.free_blocks[0] &= !mask;
        self.occupied += num_blocks;
        self.update_longest_run();
        (mask, first)
    }

    /// Release the units in `mask`.
    ///
    /// # Panics
    ///
    /// Panics if any unit in `mask` is already free.
    pub fn free(&mut self, mask: u32) {
        assert!(mask != 0, "free of empty mask");
        assert_eq!(
            self.free_blocks[0] & mask,
            0,
            "free of units that are not occupied: {mask:#034b}"
        );

        self.free_blocks[0] |= mask;
        self.occupied -= mask.count_ones();
        self.update_longest_run();
    }

    fn update_longest_run(&mut self) {
        let mut f = self.free_blocks[0];
        let mut run = 0;
        while f != 0 {
            self.free_blocks[run] = f;
            run += 1;
            f &= f >> 1;
        }
        for stale in &mut self.free_blocks[run..] {
            *stale = 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            self.longest_run = run as u32;
        }
    }
}

impl Drop for FreeBlockTracker {
    fn drop(&mut self) {
        if self.occupied != 0 {
            log::error!(
                "sub-block tracker dropped with {} occupied units (free mask {:#034b})",
                self.occupied,
                self.free_blocks[0]
            );
        }
    }
}
