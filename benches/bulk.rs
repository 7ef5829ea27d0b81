use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SIZE: u64 = 1 << 18;

fn sum(c: &mut Criterion) {
    let mut group = c.benchmark_group("sum");

    let m = binmap::HashMap::<u64, u64>::with_capacity(SIZE as usize);
    {
        let m = m.pin();
        for i in 0..SIZE {
            m.insert(i, i).unwrap();
        }
    }

    for threshold in [u64::MAX, 1 << 12, 1] {
        group.bench_with_input(BenchmarkId::new("binmap", threshold), &threshold, |b, &threshold| {
            b.iter(|| black_box(m.reduce_values_to_i64(threshold, |v| *v as i64, 0, |a, b| a + b)));
        });
    }

    group.bench_function("dashmap", |b| {
        let m = dashmap::DashMap::<u64, u64>::with_capacity(SIZE as usize);
        for i in 0..SIZE {
            m.insert(i, i);
        }

        b.iter(|| black_box(m.iter().map(|e| *e.value() as i64).sum::<i64>()));
    });

    group.finish();
}

fn search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");

    let m = binmap::HashMap::<u64, u64>::with_capacity(SIZE as usize);
    {
        let m = m.pin();
        for i in 0..SIZE {
            m.insert(i, i).unwrap();
        }
    }

    for threshold in [u64::MAX, 1 << 12, 1] {
        group.bench_with_input(BenchmarkId::new("binmap", threshold), &threshold, |b, &threshold| {
            b.iter(|| black_box(m.search_values(threshold, |v| (*v == SIZE - 1).then_some(*v))));
        });
    }

    group.finish();
}

criterion_group!(benches, sum, search);
criterion_main!(benches);
