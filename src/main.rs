// Esox ItemPool demo
// Runs concurrent workers against a pool of simulated connections

use async_trait::async_trait;
use esox_itempool::{BoxDynError, KeepaliveChecker, PoolBuilder, factory_fn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stand-in for a database connection
#[derive(Debug)]
struct Connection {
    id: u32,
}

struct PingChecker;

#[async_trait]
impl KeepaliveChecker<Connection> for PingChecker {
    async fn check(&self, connection: &Connection) -> bool {
        tokio::time::sleep(Duration::from_millis(1)).await;
        connection.id % 7 != 0
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(200)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxDynError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let next_id = Arc::new(AtomicU32::new(1));
    let factory = factory_fn(move || {
        let next_id = Arc::clone(&next_id);
        async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, BoxDynError>(Connection {
                id: next_id.fetch_add(1, Ordering::Relaxed),
            })
        }
    });

    let pool = PoolBuilder::new(4, Arc::new(factory))
        .with_minimum_idle(2)
        .with_borrow_timeout(Duration::from_millis(250))
        .with_keepalive_checker(Arc::new(PingChecker))
        .with_connection_checker(|connection: &Connection| connection.id != 3)
        .with_name("demo")
        .build()
        .await?;

    info!(pool = pool.name(), size = pool.current_size(), "Pool ready");

    let mut workers = Vec::new();
    for worker in 0..8 {
        let handle_pool = Arc::clone(&pool);
        workers.push(pool.spawn(async move {
            for round in 0..5 {
                match handle_pool.borrow().await {
                    Ok(connection) => {
                        // same task, same connection
                        let again = handle_pool.borrow().await?;
                        debug_assert!(Arc::ptr_eq(&connection, &again));

                        info!(worker, round, connection = connection.id, "Query executed");
                        tokio::time::sleep(Duration::from_millis(20)).await;

                        let mut connection = Some(connection);
                        handle_pool.return_item(&mut connection).await?;
                    }
                    Err(e) => warn!(worker, round, error = %e, "Borrow failed"),
                }
            }
            Ok::<_, esox_itempool::PoolError>(())
        }));
    }

    for worker in workers {
        if let Err(e) = worker.await? {
            warn!(error = %e, "Worker failed");
        }
    }

    let stats = pool.stats();
    println!("\nPool statistics:");
    let mut exported: Vec<_> = stats.export().into_iter().collect();
    exported.sort();
    for (name, value) in exported {
        println!("  {name}: {value}");
    }

    let mut tags = HashMap::new();
    tags.insert("service".to_string(), "demo".to_string());
    println!("\nPrometheus export:\n{}", pool.export_metrics_prometheus(Some(&tags)));

    Ok(())
}
