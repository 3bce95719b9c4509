use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use esox_itempool::{BoxDynError, ItemWrapperFactory, Pool, PoolConfig, factory_fn};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn build_pool(runtime: &Runtime, capacity: usize) -> Arc<Pool<u64>> {
    runtime.block_on(async {
        let factory = factory_fn(|| async { Ok::<_, BoxDynError>(42u64) });
        let pool = Pool::new(
            "bench",
            PoolConfig::new(capacity).with_borrow_timeout(Duration::from_secs(1)),
            ItemWrapperFactory::without_tasks(Arc::new(factory)),
            None,
            None,
        )
        .await
        .expect("pool");

        for _ in 0..capacity {
            pool.increase_items().await.expect("item");
        }
        pool
    })
}

fn borrow_return(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let mut group = c.benchmark_group("borrow_return");

    for capacity in [1usize, 16] {
        let pool = build_pool(&runtime, capacity);

        group.bench_with_input(BenchmarkId::new("round_trip", capacity), &pool, |b, pool| {
            b.to_async(&runtime).iter(|| async {
                let mut item = Some(pool.borrow().await.expect("borrow"));
                pool.return_item(&mut item).await.expect("return");
            });
        });
    }

    group.finish();
}

fn concurrent_borrowers(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let pool = build_pool(&runtime, 8);

    c.bench_function("borrow_return/concurrent_32", |b| {
        b.to_async(&runtime).iter(|| {
            let pool = Arc::clone(&pool);
            async move {
                let workers: Vec<_> = (0..32)
                    .map(|_| {
                        let pool = Arc::clone(&pool);
                        tokio::spawn(async move {
                            if let Ok(item) = pool.borrow().await {
                                let mut item = Some(item);
                                let _ = pool.return_item(&mut item).await;
                            }
                        })
                    })
                    .collect();

                for worker in workers {
                    let _ = worker.await;
                }
            }
        });
    });
}

criterion_group!(benches, borrow_return, concurrent_borrowers);
criterion_main!(benches);
