use assert_matches::assert_matches;

use kira_pipeline::batch::{BatchLimits, line_count, plan_batches};
use kira_pipeline::error::PipelineError;

fn limits(max_items: usize, max_chars: usize, parallelism: usize) -> BatchLimits {
    BatchLimits {
        max_items,
        max_chars,
        parallelism,
    }
}

#[test]
fn batches_partition_the_items() {
    for n in [1, 2, 5, 17, 100, 101, 250] {
        for parallelism in [1, 2, 3, 7] {
            for max_items in [1, 4, 100] {
                let ranges =
                    plan_batches("stage", n, 37, 20, limits(max_items, 5000, parallelism)).unwrap();

                let mut next = 0;
                for range in &ranges {
                    assert_eq!(range.start, next, "contiguous and disjoint");
                    assert!(!range.is_empty());
                    assert!(range.len() <= max_items);
                    next = range.end;
                }
                assert_eq!(next, n, "every item is on exactly one line");

                let longest = ranges.iter().map(|range| range.len()).max().unwrap();
                let shortest = ranges.iter().map(|range| range.len()).min().unwrap();
                assert!(longest - shortest <= 1, "n={n} p={parallelism} max={max_items}");
                assert_eq!(ranges.len(), line_count(n, max_items, parallelism));
            }
        }
    }
}

#[test]
fn line_count_rounds_up_to_parallelism() {
    assert_eq!(line_count(0, 10, 4), 0);
    assert_eq!(line_count(10, 100, 4), 4);
    assert_eq!(line_count(3, 100, 4), 3, "never more lines than items");
    assert_eq!(line_count(250, 100, 1), 3);
    assert_eq!(line_count(250, 100, 2), 4);
}

#[test]
fn character_cap_bounds_every_line() {
    let prefix_len = 40;
    let item_width = 37;
    let max_chars = 200;
    let ranges = plan_batches("stage", 30, item_width, prefix_len, limits(100, max_chars, 1)).unwrap();
    assert_eq!(ranges.len(), 8);
    for range in ranges {
        assert!(prefix_len + range.len() * item_width <= max_chars);
    }
}

#[test]
fn item_wider_than_the_cap_fails() {
    assert_matches!(
        plan_batches("Wide", 3, 80, 30, limits(100, 100, 1)),
        Err(PipelineError::BatchItemTooWide { needed: 110, cap: 100, .. })
    );
}
