use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use chrono::{TimeZone, Utc};
use flat_scout::{
    cache::{JourneyCache, MemoryStore},
    geo::Coordinate,
    mock_server::journey,
};
use rand::{seq::SliceRandom, thread_rng, Rng};
use std::sync::Arc;
use std::thread;

// Concurrent lookups against a journey cache, with a share of writes that
// each persist the whole map
pub fn cache_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("journey_cache");
    let arrival = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();

    let destinations = vec![
        Coordinate::new(51.515, -0.09),
        Coordinate::new(51.53, -0.12),
        Coordinate::new(51.505, -0.02),
    ];

    for origins_count in [100usize, 1000].iter() {
        let origins: Vec<Coordinate> = (0..*origins_count)
            .map(|i| Coordinate::new(51.3 + i as f64 * 1e-4, -0.4 + i as f64 * 2e-4))
            .collect();

        group.bench_with_input(
            BenchmarkId::from_parameter(origins_count),
            origins_count,
            |b, _| {
                b.iter(|| {
                    let cache = Arc::new(JourneyCache::open(MemoryStore::new(), false).unwrap());
                    for origin in &origins {
                        for destination in &destinations {
                            cache.put(*origin, *destination, vec![journey(35, arrival)]).unwrap();
                        }
                    }

                    // Spawn multiple threads to simulate concurrent workers
                    let mut handles = vec![];
                    for _ in 0..4 {
                        let cache = Arc::clone(&cache);
                        let origins = origins.clone();
                        let destinations = destinations.clone();

                        handles.push(thread::spawn(move || {
                            let mut rng = thread_rng();
                            for _ in 0..250 {
                                let origin = *origins.choose(&mut rng).unwrap();
                                let destination = *destinations.choose(&mut rng).unwrap();

                                if rng.gen_bool(0.05) {
                                    let minutes = rng.gen_range(10..90);
                                    let _ = cache.put(origin, destination, vec![journey(minutes, arrival)]);
                                } else {
                                    let _ = cache.get(origin, destination);
                                }
                            }
                        }));
                    }

                    for handle in handles {
                        handle.join().unwrap();
                    }

                    black_box(cache.stats())
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, cache_benchmark);
criterion_main!(benches);
