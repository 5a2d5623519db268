//! Range list benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use memtrack_core::Range;
use memtrack_range::{NonOverlappingRangeList, SortedRangeList};

fn populated_disjoint(count: u64) -> NonOverlappingRangeList<Range> {
    let mut list = NonOverlappingRangeList::with_capacity(count as usize);
    for i in 0..count {
        list.add(Range::new(i * 0x100, 0x80)).unwrap();
    }
    list
}

fn bench_disjoint(c: &mut Criterion) {
    let list = populated_disjoint(4096);

    c.bench_function("non_overlapping/edges_4096", |b| {
        b.iter(|| list.binary_search_edges(black_box(0x1_0000), black_box(0x1_8000)));
    });

    c.bench_function("non_overlapping/get_or_add_regions", |b| {
        b.iter_batched(
            || populated_disjoint(1024),
            |mut list| {
                list.get_or_add_regions(black_box(0x40), black_box(0x2_0000), Range::new)
                    .map(|covering| covering.len())
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_sorted(c: &mut Criterion) {
    let mut list = SortedRangeList::with_capacity(4096);
    for i in 0..4096u64 {
        // Every eighth item spans far ahead to exercise the running max.
        let size = if i % 8 == 0 { 0x1000 } else { 0x80 };
        list.add(Range::new(i * 0x100, size));
    }

    c.bench_function("sorted/find_overlaps_4096", |b| {
        b.iter(|| list.find_overlaps(black_box(0x8_0000), black_box(0x800)).len());
    });
}

criterion_group!(benches, bench_disjoint, bench_sorted);
criterion_main!(benches);
