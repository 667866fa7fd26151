//! Basic example: a text call and an image analysis through one client.
//!
//! This example shows how to:
//! - Create a client from an API key
//! - Generate text and analyse an image
//! - Inspect latency and retry history on the response
//!
//! Run with: `GEMINI_API_KEY=... cargo run --example basic_call -- path/to/photo.jpg`

use callward::{CallContext, Error, GeminiClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Initialize tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter("callward=debug,basic_call=info")
        .init();

    let api_key = std::env::var("GEMINI_API_KEY")
        .map_err(|_| Error::ConfigurationError("GEMINI_API_KEY is not set".to_string()))?;
    let client = GeminiClient::from_api_key(api_key)?;

    // One minute for the whole call, retries included
    let ctx = CallContext::new().with_timeout(Duration::from_secs(60));

    println!("=== Text Generation ===");
    let response = client
        .generate_text(&ctx, "Suggest three paint colours for a small north-facing study.")
        .await?;

    println!("{}", response.data);
    println!("Latency: {:?}", response.latency);
    println!("Attempts: {}", response.attempts);
    println!();

    if let Some(path) = std::env::args().nth(1) {
        println!("=== Image Analysis ===");
        let image = std::fs::read(&path)
            .map_err(|e| Error::ConfigurationError(format!("cannot read {path}: {e}")))?;

        let response = client
            .analyze_image(&ctx, "Describe the style of this room.", &image, "image/jpeg")
            .await?;

        println!("{}", response.data);
        println!("Was retried: {}", response.was_retried());
        for attempt in &response.history {
            println!(
                "  attempt {} after {:?}: {:?} in {:?}",
                attempt.index, attempt.delay_before, attempt.classification, attempt.duration
            );
        }
    }

    Ok(())
}
