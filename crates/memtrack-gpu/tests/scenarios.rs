//! End-to-end dirty tracking and range cache scenarios.

use memtrack_core::{MemoryRange, MultiRange};
use memtrack_gpu::{CacheConfig, TrackerConfig, UnmapEvent, VirtualRangeCache};
use memtrack_test::{entries, PagedTranslator, TrackerFixture};

#[test]
fn write_split_flush_and_clear() {
    let fixture = TrackerFixture::starting_at(1)
        .with_config(TrackerConfig::default().with_initial_capacity(2));
    let (tracker, _) = fixture.tracker("vertex", 0x1000, 0x100);

    tracker.signal_modified(0x1000, 0x20);
    fixture.close_batch();
    tracker.signal_modified(0x1008, 0x8);
    tracker.signal_modified(0x1080, 0x40);
    assert_eq!(
        entries(&tracker),
        vec![(0x1000, 0x8, 1), (0x1008, 0x8, 2), (0x1010, 0x10, 1), (0x1080, 0x40, 2)]
    );

    let mut clean = Vec::new();
    tracker.exclude_modified_regions(0x1000, 0x100, |address, size| clean.push((address, size)));
    assert_eq!(clean, vec![(0x1020, 0x60), (0x10c0, 0x40)]);

    fixture.close_and_retire();
    tracker.wait_for_and_flush_ranges(0x1000, 0x20);
    tracker.clear(0x10a0, 0x100);

    insta::assert_yaml_snapshot!(fixture.log.records(), @r###"
    ---
    - buffer: vertex
      address: 4096
      size: 8
      sync_number: 2
    - buffer: vertex
      address: 4104
      size: 8
      sync_number: 2
    - buffer: vertex
      address: 4112
      size: 16
      sync_number: 2
    "###);
    assert_eq!(entries(&tracker), vec![(0x1080, 0x20, 2)]);
}

#[test]
fn sparse_cache_over_paged_translation() {
    let translator = PagedTranslator::new(0x1_0000).unwrap();
    translator.map(0x0, 0x40_0000, 0x1_0000).unwrap();
    translator.map(0x2_0000, 0x90_0000, 0x1_0000).unwrap();
    let cache = VirtualRangeCache::with_config(
        translator,
        CacheConfig::default().with_sparse_alignment(0x1_0000),
    );

    let lookup = cache.try_get_or_add_range(0x0, 0x3_0000);
    assert!(!lookup.found);
    assert_eq!(
        lookup.range.sub_ranges(),
        &[
            MemoryRange::new(0x40_0000, 0x1_0000),
            MemoryRange::unmapped(0x1_0000),
            MemoryRange::new(0x90_0000, 0x1_0000),
        ]
    );

    let inner = cache.try_get_or_add_range(0x1_0000, 0x1_8000);
    assert!(inner.found);
    assert_eq!(
        inner.range,
        MultiRange::from_ranges(vec![
            MemoryRange::unmapped(0x1_0000),
            MemoryRange::new(0x90_0000, 0x8000),
        ])
    );

    // A misaligned inner size collapses to one range.
    let collapsed = cache.try_get_or_add_range(0x8000, 0x1_8000);
    assert!(collapsed.found);
    assert_eq!(collapsed.range, MultiRange::new(0x40_8000, 0x1_8000));

    let mut event = UnmapEvent::new(0x2_0000, 0x1_0000);
    cache.memory_unmapped_handler(&mut event);
    event.run_remap_actions();
    assert!(!cache.try_get_or_add_range(0x0, 0x1000).found);
    assert_eq!(cache.len(), 1);
}
