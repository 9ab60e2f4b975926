//! Three-phase parallel in-place partitioning
//!
//! Phase 1 partitions disjoint subranges serially in parallel tasks.
//! Phase 2 combines the per-task reductions, computes the global split
//! and derives the misplaced ranges on each side of it. Phase 3 swaps the
//! misplaced elements pairwise, again in parallel, walking both range
//! lists as virtual concatenations indexed by one linear coordinate.
//!
//! No locking anywhere: phase 1 tasks own disjoint subranges by
//! construction, and phase 3 tasks split the (equal-length) virtual
//! concatenations at identical endpoints, so every linear index maps to
//! exactly one cell pair.

use std::ops::Range;

use rayon::prelude::*;

use crate::serial::serial_partition;

/// Upper bound on the number of parallel tasks per call.
pub const MAX_TASKS: usize = 512;

/// Raw view of the array shared across phase tasks.
///
/// Hands out overlapping-capable access; every use site must argue
/// disjointness.
struct SharedSlice<T> {
    ptr: *mut T,
    len: usize,
}

// SAFETY: tasks access pairwise disjoint element sets (subranges in phase
// 1, unique cell pairs in phase 3), so concurrent mutation never aliases.
// T: Send because elements are mutated from whichever worker thread owns
// their task.
unsafe impl<T: Send> Sync for SharedSlice<T> {}

impl<T> SharedSlice<T> {
    fn new(slice: &mut [T]) -> Self {
        Self { ptr: slice.as_mut_ptr(), len: slice.len() }
    }

    /// # Safety
    ///
    /// `[start, end)` must be in bounds and not concurrently accessed by
    /// any other task.
    unsafe fn subrange(&self, start: usize, end: usize) -> &mut [T] {
        debug_assert!(start <= end && end <= self.len);
        // SAFETY: bounds and exclusivity per the caller's contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), end - start) }
    }

    /// # Safety
    ///
    /// `i` and `j` must be distinct, in bounds, and not concurrently
    /// accessed by any other task.
    unsafe fn swap(&self, i: usize, j: usize) {
        debug_assert!(i != j && i < self.len && j < self.len);
        // SAFETY: distinct in-bounds cells, exclusive per the contract.
        unsafe { std::ptr::swap(self.ptr.add(i), self.ptr.add(j)) };
    }
}

/// Per-task result of the local partition pass.
#[derive(Clone)]
struct TaskRecord<V> {
    start: usize,
    left_count: usize,
    left: V,
    right: V,
}

/// Partitions `array` in place around `pred` using parallel tasks,
/// folding a reduction over each side.
///
/// Returns `(mid, left, right)` where `mid` is the number of elements
/// satisfying `pred`, every index below `mid` satisfies it afterwards and
/// none at or above `mid` does. `fold` accumulates single elements,
/// `combine` merges per-task accumulators seeded with `init`.
///
/// `BLOCK_SIZE` is the smallest subrange worth a task; inputs shorter
/// than it (or a single-threaded runtime) fall back to
/// [`serial_partition`]. `max_threads` caps the task count and defaults
/// to the rayon pool width.
///
/// The partition is not stable. The reduction is combined in task order;
/// with a non-commutative `combine`, results depend on the task count.
pub fn parallel_partition<const BLOCK_SIZE: usize, T, V, P, F, C>(
    array: &mut [T],
    init: V,
    pred: &P,
    fold: &F,
    combine: &C,
    max_threads: Option<usize>,
) -> (usize, V, V)
where
    T: Send,
    V: Clone + Send,
    P: Fn(&T) -> bool + Sync,
    F: Fn(&mut V, &T) + Sync,
    C: Fn(&mut V, &V),
{
    const { assert!(BLOCK_SIZE > 0) };

    let n = array.len();
    let threads = max_threads.unwrap_or_else(rayon::current_num_threads).max(1);
    let tasks = task_count::<BLOCK_SIZE>(n, threads);

    if n < BLOCK_SIZE || tasks == 1 {
        let mut left = init.clone();
        let mut right = init;
        let mid = serial_partition(array, &mut left, &mut right, pred, fold);
        return (mid, left, right);
    }

    let shared = SharedSlice::new(array);

    // Phase 1: local partition of disjoint subranges.
    let mut records: Vec<TaskRecord<V>> = (0..tasks)
        .map(|t| TaskRecord {
            start: t * n / tasks,
            left_count: 0,
            left: init.clone(),
            right: init.clone(),
        })
        .collect();
    records.par_iter_mut().enumerate().for_each(|(t, record)| {
        let start = t * n / tasks;
        let end = (t + 1) * n / tasks;
        // SAFETY: the subranges [t*n/tasks, (t+1)*n/tasks) tile the array
        // without overlap, and each task touches only its own.
        let sub = unsafe { shared.subrange(start, end) };
        record.left_count = serial_partition(sub, &mut record.left, &mut record.right, pred, fold);
    });

    // Phase 2: combine reductions and locate misplaced ranges.
    let mut left_acc = init.clone();
    let mut right_acc = init;
    for record in &records {
        combine(&mut left_acc, &record.left);
        combine(&mut right_acc, &record.right);
    }

    let global_mid: usize = records.iter().map(|r| r.left_count).sum();
    let global_left = 0..global_mid;
    let global_right = global_mid..n;

    let mut left_misplaced: Vec<Range<usize>> = Vec::with_capacity(tasks);
    let mut right_misplaced: Vec<Range<usize>> = Vec::with_capacity(tasks);
    let mut misplaced_left_items = 0;
    let mut misplaced_right_items = 0;

    for (t, record) in records.iter().enumerate() {
        let end = (t + 1) * n / tasks;
        let task_left = record.start..record.start + record.left_count;
        let task_right = record.start + record.left_count..end;

        // Elements this task classified right but that belong left of the
        // global split, and vice versa.
        let left_mis = range_intersect(&global_left, &task_right);
        if !left_mis.is_empty() {
            misplaced_left_items += range_len(&left_mis);
            left_misplaced.push(left_mis);
        }
        let right_mis = range_intersect(&global_right, &task_left);
        if !right_mis.is_empty() {
            misplaced_right_items += range_len(&right_mis);
            right_misplaced.push(right_mis);
        }
    }

    // Mass conservation: both halves miss the same number of elements.
    assert_eq!(
        misplaced_left_items, misplaced_right_items,
        "misplaced element counts must balance"
    );
    let misplaced = misplaced_left_items;

    // Phase 3: pairwise swap of the misplaced elements.
    if misplaced > 0 {
        (0..tasks).into_par_iter().for_each(|t| {
            let start_id = t * misplaced / tasks;
            let end_id = (t + 1) * misplaced / tasks;
            if start_id == end_id {
                return;
            }
            // SAFETY: both virtual concatenations have length `misplaced`
            // and every task slices them at the same endpoints, so each
            // linear index resolves to one unique (left, right) cell pair;
            // left cells lie below the global split, right cells at or
            // above it, hence all cells are distinct.
            unsafe {
                swap_misplaced(&shared, &left_misplaced, &right_misplaced, start_id, end_id);
            }
        });
    }

    (global_mid, left_acc, right_acc)
}

fn task_count<const BLOCK_SIZE: usize>(n: usize, threads: usize) -> usize {
    let tasks =
        if n.div_ceil(threads) >= BLOCK_SIZE { threads } else { n.div_ceil(BLOCK_SIZE) };
    tasks.clamp(1, MAX_TASKS)
}

fn range_len(range: &Range<usize>) -> usize {
    range.end - range.start
}

fn range_intersect(a: &Range<usize>, b: &Range<usize>) -> Range<usize> {
    let start = a.start.max(b.start);
    let end = a.end.min(b.end);
    start..end.max(start)
}

/// Locates `index` inside the virtual concatenation of `ranges`,
/// returning the range index and the offset within it.
///
/// Callers guarantee `index < Σ range lengths`.
fn find_start_range(mut index: usize, ranges: &[Range<usize>]) -> (usize, usize) {
    let mut i = 0;
    while index >= range_len(&ranges[i]) {
        index -= range_len(&ranges[i]);
        i += 1;
    }
    (i, index)
}

/// Swaps the `[start_id, end_id)` slice of the misplaced pairs, walking
/// both range lists with one linear coordinate.
///
/// # Safety
///
/// See the phase-3 call site: the slice must resolve to cell pairs no
/// other task touches concurrently, and `end_id` must not exceed the
/// total misplaced count.
unsafe fn swap_misplaced<T>(
    shared: &SharedSlice<T>,
    left_ranges: &[Range<usize>],
    right_ranges: &[Range<usize>],
    start_id: usize,
    end_id: usize,
) {
    let (mut li, l_offset) = find_start_range(start_id, left_ranges);
    let (mut ri, r_offset) = find_start_range(start_id, right_ranges);

    let mut l_pos = left_ranges[li].start + l_offset;
    let mut r_pos = right_ranges[ri].start + r_offset;
    let mut l_left = left_ranges[li].end - l_pos;
    let mut r_left = right_ranges[ri].end - r_pos;
    let mut remaining = end_id - start_id;

    while remaining > 0 {
        if l_left == 0 {
            li += 1;
            l_pos = left_ranges[li].start;
            l_left = range_len(&left_ranges[li]);
        }
        if r_left == 0 {
            ri += 1;
            r_pos = right_ranges[ri].start;
            r_left = range_len(&right_ranges[ri]);
        }

        let run = remaining.min(l_left).min(r_left);
        for _ in 0..run {
            // SAFETY: forwarded from the caller; positions advance through
            // disjoint cells of this task's slice.
            unsafe { shared.swap(l_pos, r_pos) };
            l_pos += 1;
            r_pos += 1;
        }
        remaining -= run;
        l_left -= run;
        r_left -= run;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_count_prefers_threads_for_large_inputs() {
        assert_eq!(task_count::<1024>(1 << 20, 8), 8);
    }

    #[test]
    fn task_count_shrinks_for_small_inputs() {
        // 10 blocks of work for 8 threads, but only 3 blocks available.
        assert_eq!(task_count::<1024>(3 * 1024, 8), 3);
    }

    #[test]
    fn task_count_clamps_to_max() {
        assert_eq!(task_count::<1>(1 << 20, 4096), MAX_TASKS);
    }

    #[test]
    fn intersect_clamps_empty() {
        let r = range_intersect(&(0..4), &(10..20));
        assert!(r.is_empty());
        assert_eq!(range_len(&r), 0);
    }

    #[test]
    fn intersect_overlap() {
        assert_eq!(range_intersect(&(0..10), &(5..20)), 5..10);
    }

    #[test]
    fn find_start_range_walks_prefix() {
        let ranges = vec![0..3, 10..14, 20..21];
        assert_eq!(find_start_range(0, &ranges), (0, 0));
        assert_eq!(find_start_range(2, &ranges), (0, 2));
        assert_eq!(find_start_range(3, &ranges), (1, 0));
        assert_eq!(find_start_range(6, &ranges), (1, 3));
        assert_eq!(find_start_range(7, &ranges), (2, 0));
    }
}
