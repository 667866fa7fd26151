//! Example demonstrating how failures surface to the caller.
//!
//! No network is needed: a closure stands in for the remote service so each failure
//! mode can be triggered on demand.
//!
//! Run with: `cargo run --example error_handling`

use callward::{
    CallContext, CircuitBreakerConfig, Error, ErrorClassification, ResilientCaller, RetryPolicy,
};
use std::time::Duration;

fn describe(result: Result<callward::Response<String>, Error>) {
    match result {
        Ok(response) => println!("Success after {} attempt(s): {}", response.attempts, response.data),
        Err(Error::RateLimited { operation, retry_after }) => {
            println!("'{operation}' is rate limited, retry in {retry_after:?}");
        }
        Err(Error::CircuitOpen { operation, retry_after }) => {
            println!("'{operation}' circuit is open, next probe in {retry_after:?}");
        }
        Err(Error::MaxRetriesExceeded { attempts, last_error }) => {
            println!(
                "Gave up after {attempts} attempts, last error ({}): {last_error}",
                last_error.classification()
            );
        }
        Err(e) => println!("Failed without retrying ({}): {e}", e.classification()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("callward=info")
        .init();

    let caller = ResilientCaller::builder()
        .retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        })
        .circuit_breaker(CircuitBreakerConfig::default().with_failure_threshold(2))
        .build()?;
    let ctx = CallContext::new();

    println!("=== Transient failure, then success ===");
    describe(
        caller
            .execute_validated("demo_flaky", &ctx, |attempt| async move {
                if attempt < 2 {
                    Err(Error::Api {
                        message: "503 Service Unavailable".to_string(),
                    })
                } else {
                    Ok("recovered".to_string())
                }
            })
            .await,
    );

    println!("\n=== Fatal error is not retried ===");
    describe(
        caller
            .execute("demo_auth", &ctx, |_| async {
                Err::<String, _>(Error::Api {
                    message: "401 Unauthorized: API key not valid".to_string(),
                })
            })
            .await,
    );

    println!("\n=== Blank responses are retried, then given up on ===");
    describe(
        caller
            .execute_validated("demo_blank", &ctx, |_| async { Ok::<_, Error>("  ".to_string()) })
            .await,
    );

    println!("\n=== Repeated failures open the circuit ===");
    for _ in 0..3 {
        describe(
            caller
                .execute("demo_down", &ctx, |_| async {
                    Err::<String, _>(Error::Timeout)
                })
                .await,
        );
    }
    println!(
        "Circuit for 'demo_down' is now {}",
        caller.circuit_breaker().state("demo_down")
    );

    println!("\n=== Classification of opaque messages ===");
    for message in ["connection reset by peer", "403 Forbidden", "model is overloaded"] {
        let classification = callward::classify::classify_message(message);
        let retry = if classification == ErrorClassification::Retryable {
            "retry"
        } else {
            "do not retry"
        };
        println!("{message:?} => {classification} ({retry})");
    }

    Ok(())
}
