//! Integration tests for parallel partitioning

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use vela_partition::{parallel_partition, serial_partition};

fn sum_fold(acc: &mut u64, value: &u32) {
    *acc += u64::from(*value);
}

fn sum_combine(acc: &mut u64, other: &u64) {
    *acc += other;
}

/// Runs the parallel path with a small block size so even short inputs
/// fan out.
fn partition_small_blocks(array: &mut [u32], pred: impl Fn(&u32) -> bool + Sync) -> (usize, u64, u64) {
    parallel_partition::<2, _, _, _, _, _>(array, 0u64, &pred, &sum_fold, &sum_combine, Some(4))
}

#[test]
fn empty_input_returns_init() {
    let mut array: [u32; 0] = [];
    let (mid, left, right) = partition_small_blocks(&mut array, |_| true);
    assert_eq!(mid, 0);
    assert_eq!((left, right), (0, 0));
}

#[test]
fn single_true_element() {
    let mut array = [42u32];
    let (mid, left, right) = partition_small_blocks(&mut array, |_| true);
    assert_eq!(mid, 1);
    assert_eq!(array, [42]);
    assert_eq!(left, 42);
    assert_eq!(right, 0);
}

#[test]
fn evens_partition_with_sums() {
    let mut array = [1u32, 2, 3, 4, 5, 6, 7, 8];
    let (mid, left, right) = partition_small_blocks(&mut array, |x| x % 2 == 0);

    assert_eq!(mid, 4);
    let mut front: Vec<u32> = array[..4].to_vec();
    let mut back: Vec<u32> = array[4..].to_vec();
    front.sort_unstable();
    back.sort_unstable();
    assert_eq!(front, [2, 4, 6, 8]);
    assert_eq!(back, [1, 3, 5, 7]);
    assert_eq!(left, 20);
    assert_eq!(right, 16);
}

#[test]
fn matches_serial_on_random_input() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let original: Vec<u32> = (0..1 << 16).map(|_| rng.gen_range(0..1000)).collect();
    let pred = |x: &u32| *x < 300;

    let mut parallel_copy = original.clone();
    let (par_mid, par_left, par_right) = parallel_partition::<1024, _, _, _, _, _>(
        &mut parallel_copy,
        0u64,
        &pred,
        &sum_fold,
        &sum_combine,
        None,
    );

    let mut serial_copy = original.clone();
    let mut left = 0;
    let mut right = 0;
    let serial_mid = serial_partition(&mut serial_copy, &mut left, &mut right, &pred, &sum_fold);

    assert_eq!(par_mid, serial_mid);
    assert_eq!(par_left, left);
    assert_eq!(par_right, right);
}

#[test]
fn large_random_partition_invariants() {
    let mut rng = StdRng::seed_from_u64(0xDECADE);
    let n = 1 << 20;
    let original: Vec<u32> = (0..n).map(|_| rng.gen_range(0..1000)).collect();
    let pred = |x: &u32| *x < 300;
    let expected_mid = original.iter().filter(|x| pred(x)).count();
    let expected_left: u64 = original.iter().filter(|x| pred(x)).map(|&x| u64::from(x)).sum();
    let expected_right: u64 =
        original.iter().filter(|x| !pred(x)).map(|&x| u64::from(x)).sum();

    let mut array = original.clone();
    let (mid, left, right) = parallel_partition::<1024, _, _, _, _, _>(
        &mut array,
        0u64,
        &pred,
        &sum_fold,
        &sum_combine,
        Some(4),
    );

    // The split is exact: mid equals the predicate count of the input.
    assert_eq!(mid, expected_mid);
    assert!(array[..mid].iter().all(&pred));
    assert!(!array[mid..].iter().any(&pred));
    assert_eq!(left, expected_left);
    assert_eq!(right, expected_right);

    // Density 0.3 lands near 0.3 * n.
    let density = mid as f64 / n as f64;
    assert!((0.28..0.32).contains(&density), "density {density}");

    // Multiset preservation.
    let mut sorted_before = original;
    let mut sorted_after = array;
    sorted_before.sort_unstable();
    sorted_after.sort_unstable();
    assert_eq!(sorted_before, sorted_after);
}

#[test]
fn adversarial_fully_misplaced_halves() {
    // First half all false, second half all true: every element is on the
    // wrong side of the global split after phase 1.
    let n = 1 << 14;
    let mut array: Vec<u32> = (0..n as u32).map(|i| if i < (n / 2) as u32 { 1 } else { 0 }).collect();
    let (mid, left, right) = parallel_partition::<256, _, _, _, _, _>(
        &mut array,
        0u64,
        &|x| *x == 0,
        &sum_fold,
        &sum_combine,
        Some(8),
    );
    assert_eq!(mid, n / 2);
    assert!(array[..mid].iter().all(|x| *x == 0));
    assert!(array[mid..].iter().all(|x| *x == 1));
    assert_eq!(left, 0);
    assert_eq!(right, (n / 2) as u64);
}

#[test]
fn min_max_reduction() {
    let mut rng = StdRng::seed_from_u64(7);
    let original: Vec<u32> = (0..100_000).map(|_| rng.gen()).collect();
    let pivot = 1 << 31;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Bounds {
        min: u32,
        max: u32,
    }
    let empty = Bounds { min: u32::MAX, max: 0 };
    let fold = |acc: &mut Bounds, x: &u32| {
        acc.min = acc.min.min(*x);
        acc.max = acc.max.max(*x);
    };
    let combine = |acc: &mut Bounds, other: &Bounds| {
        acc.min = acc.min.min(other.min);
        acc.max = acc.max.max(other.max);
    };

    let mut array = original.clone();
    let (mid, left, right) =
        parallel_partition::<1024, _, _, _, _, _>(&mut array, empty, &|x| *x < pivot, &fold, &combine, None);

    assert_eq!(mid, original.iter().filter(|&&x| x < pivot).count());
    assert!(left.max < pivot);
    assert!(right.min >= pivot);
    assert_eq!(left.min, *original.iter().filter(|&&x| x < pivot).min().unwrap());
    assert_eq!(right.max, *original.iter().filter(|&&x| x >= pivot).max().unwrap());
}

#[test]
fn degenerate_block_size_forces_serial_path() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut array: Vec<u32> = (0..64).map(|_| rng.gen_range(0..10)).collect();
    let expected = array.iter().filter(|&&x| x < 5).count();

    // BLOCK_SIZE larger than the input: the serial fallback must produce
    // the same contract.
    let (mid, _, _) = parallel_partition::<1024, _, _, _, _, _>(
        &mut array,
        0u64,
        &|x| *x < 5,
        &sum_fold,
        &sum_combine,
        None,
    );
    assert_eq!(mid, expected);
    assert!(array[..mid].iter().all(|&x| x < 5));
}

#[test]
fn single_thread_cap_still_partitions() {
    let mut array: Vec<u32> = (0..10_000).rev().collect();
    let (mid, left, right) = parallel_partition::<64, _, _, _, _, _>(
        &mut array,
        0u64,
        &|x| x % 3 == 0,
        &sum_fold,
        &sum_combine,
        Some(1),
    );
    assert_eq!(mid, array.iter().filter(|x| *x % 3 == 0).count());
    assert!(array[..mid].iter().all(|x| x % 3 == 0));
    assert_eq!(left + right, (0..10_000u64).sum());
}

#[test]
fn many_tasks_on_small_blocks() {
    // Small blocks with a large thread cap exercise the task clamp and
    // uneven subrange boundaries.
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    let original: Vec<u32> = (0..100_003).map(|_| rng.gen_range(0..100)).collect();
    let mut array = original.clone();
    let (mid, _, _) = parallel_partition::<16, _, _, _, _, _>(
        &mut array,
        0u64,
        &|x| *x < 50,
        &sum_fold,
        &sum_combine,
        Some(600),
    );
    assert_eq!(mid, original.iter().filter(|&&x| x < 50).count());
    assert!(array[..mid].iter().all(|&x| x < 50));
    assert!(!array[mid..].iter().any(|&x| x < 50));
}
