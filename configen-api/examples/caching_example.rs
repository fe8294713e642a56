use chrono::Duration;
use configen_api::{CacheConfig, CacheOptions, RequestCache};
use std::time::Duration as StdDuration;

async fn slow_lookup(label: &str) -> Result<String, configen_api::Error> {
    // stand-in for a network round trip
    tokio::time::sleep(StdDuration::from_millis(150)).await;
    Ok(format!("payload for {}", label))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== Request cache ===");
    let cache_config = CacheConfig {
        default_ttl: Duration::seconds(30),
        ..CacheConfig::default()
    };
    let cache: RequestCache<String> = RequestCache::new(cache_config);

    // First request goes out
    let start = std::time::Instant::now();
    let first = cache
        .execute(
            "https://api.example.com/account/info",
            || async { slow_lookup("account").await },
            CacheOptions::default(),
        )
        .await?;
    println!("First request took {:?}: {}", start.elapsed(), first);

    // Second request is served from cache
    let start = std::time::Instant::now();
    let second = cache
        .execute(
            "https://api.example.com/account/info",
            || async { slow_lookup("account").await },
            CacheOptions::default(),
        )
        .await?;
    println!("Cached request took {:?}: {}", start.elapsed(), second);

    println!("\n=== Deduplication ===");
    // Concurrent callers for the same resource share one execution, even when
    // the cache-busting query parameter differs.
    let mut handles = vec![];
    for n in 0..3 {
        let cache = cache.clone();
        handles.push(tokio::spawn(async move {
            cache
                .execute(
                    &format!("https://api.example.com/data/configs?_={}", n),
                    move || async move { slow_lookup("configs").await },
                    CacheOptions::default(),
                )
                .await
        }));
    }
    for handle in handles {
        println!("Concurrent caller got: {}", handle.await??);
    }

    println!("\n=== Cache management ===");
    println!("Stats: {:?}", cache.stats());
    println!("Evicted {} expired entries", cache.evict_expired());
    cache.clear(None);
    println!("Stats after clear: {:?}", cache.stats());

    Ok(())
}
