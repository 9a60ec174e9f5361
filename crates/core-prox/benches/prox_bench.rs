//! Query-evaluation throughput: brute-force scan vs. the pruned tree
//! variants over a mid-sized scattered world.

use core_cache::{CacheEntry, LocationCache, LocationCacheListener};
use core_motion::{MotionVector3, ObjectId, SolidAngle, Time, TimedMotionVector3, Vector3};
use core_prox::query::{Query, QueryHandler, QueryId};
use core_prox::{QueryHandlerOptions, query_handler_factory};
use criterion::{Criterion, criterion_group, criterion_main};

fn scattered_world(n: u64) -> LocationCache {
    let mut cache = LocationCache::new();
    for i in 0..n {
        let x = ((i * 37) % 1009) as f32;
        let y = ((i * 61) % 1009) as f32;
        let z = ((i * 13) % 1009) as f32;
        cache.connect(CacheEntry {
            id: ObjectId::from_index(i),
            location: TimedMotionVector3::new(
                Time::null(),
                MotionVector3::stationary(Vector3::new(x, y, z)),
            ),
            center_offset: Vector3::zero(),
            center_bounds_radius: 0.0,
            max_size: 0.5 + (i % 11) as f32 / 4.0,
            mesh: String::new(),
            zernike: None,
            aggregate: false,
            local: true,
        });
    }
    cache
}

fn bench_tick(c: &mut Criterion) {
    let cache = scattered_world(2_000);
    let mut group = c.benchmark_group("handler_tick_64_queries");

    for variant in ["brute", "rtree", "rtreedist", "rtreecut", "level"] {
        let mut handler =
            query_handler_factory(variant, false, &QueryHandlerOptions::default()).unwrap();
        let ids: Vec<ObjectId> = cache.iter().map(|e| e.id).collect();
        for id in ids {
            handler.location_connected(&cache, id, false, true);
        }
        for q in 0..64u64 {
            handler.register_query(
                &cache,
                Query::new(
                    QueryId(q),
                    Vector3::new(((q * 131) % 1009) as f32, ((q * 17) % 1009) as f32, 0.0),
                    SolidAngle::new(0.05),
                ),
            );
        }
        let mut t = 0u64;
        group.bench_function(variant, |b| {
            b.iter(|| {
                t += 1;
                handler.tick(&cache, Time::from_millis(t * 10));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tick);
criterion_main!(benches);
