//! Example demonstrating per-operation admission control.
//!
//! This example shows how to:
//! - Configure a rate limit per operation key
//! - See a call rejected once the window is full, with the wait time
//! - Load settings from the environment
//!
//! Run with: `CALLWARD_MAX_RETRIES=2 cargo run --example rate_limiting`

use callward::{CallContext, Error, RateLimitRule, ResilienceConfig, ResilientCaller};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("callward=debug")
        .init();

    let config = ResilienceConfig::from_env()?
        .with_rate_limit("demo_search", RateLimitRule::new(3, Duration::from_secs(5)));
    println!("Retry budget: {} attempt(s)", config.retry.max_attempts);

    let caller = ResilientCaller::builder().config(config).build()?;
    let ctx = CallContext::new();

    println!("=== Filling the window (3 calls per 5 seconds) ===");
    for i in 1..=4 {
        let result = caller
            .execute("demo_search", &ctx, |_| async move { Ok::<_, Error>(i) })
            .await;
        match result {
            Ok(response) => println!("Call {} admitted", response.data),
            Err(Error::RateLimited { retry_after, .. }) => {
                println!("Call {i} rejected, window frees up in {retry_after:?}");
                tokio::time::sleep(retry_after).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("\n=== After waiting ===");
    let response = caller
        .execute("demo_search", &ctx, |_| async { Ok::<_, Error>("admitted again") })
        .await?;
    println!("{}", response.data);
    println!(
        "Requests in window: {}",
        caller.rate_limiter().in_window("demo_search")
    );

    println!("\n=== Each operation has its own window ===");
    for key in ["gemini_text", "gemini_image_generation"] {
        let rule = caller.rate_limiter().rule(key);
        println!("{key}: {} per {:?}", rule.max_requests, rule.window);
    }

    Ok(())
}
