use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use taskguard::*;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// Pretends to be a build step that takes `ms` milliseconds.
fn step(name: &str, ms: u64) -> Task {
    let label = name.to_string();
    Task::from_fn(name, move |_ctx, params| {
        let label = label.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(TaskReport::success(json!({
                "step": label,
                "target": params.get("target").cloned().unwrap_or_default(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        }
    })
    .with_parameter("target", "release")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => CoreConfig::from_file(path)?,
        None => CoreConfig::default(),
    };
    let context = ExecutionContext::new(config)?;

    // The registry hands out the same breaker to every caller of "artifact-store".
    let flaky_upload = {
        let calls = Arc::new(AtomicU32::new(0));
        Task::from_fn("upload", move |_ctx, _params| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 2 {
                    Err(OperationError::network("connection reset by artifact store"))
                } else {
                    Ok(TaskReport::success(json!({ "uploaded": true, "attempts": attempt })))
                }
            }
        })
        .depends_on("package")
    };

    let tasks = vec![
        step("checkout", 50),
        step("compile", 120).depends_on("checkout"),
        step("lint", 80).depends_on("checkout").with_priority(5),
        step("test", 150).with_dependencies(["compile"]),
        step("package", 60).with_dependencies(["compile", "test", "lint"]),
        context.protect(flaky_upload, "artifact-store"),
        step("notify", 10).with_dependencies(["upload"]).with_timeout(Duration::from_secs(2)),
    ];

    let plan = context.scheduler().build_execution_plan(tasks.clone())?;
    println!("=== Execution plan ===");
    for (i, batch) in plan.batch_names().iter().enumerate() {
        println!("{}. {}", i + 1, batch.join(", "));
    }

    println!("=== Running ===");
    let start = std::time::Instant::now();
    let results = context
        .execute_with_dependencies(CancellationToken::new(), tasks)
        .await?;
    println!("Finished in {:?}", start.elapsed());

    let mut names: Vec<&String> = results.keys().collect();
    names.sort();
    for name in names {
        let result = &results[name];
        println!(
            "{name:<10} {:?} exit={} {:.3}s",
            result.status,
            result.exit_code,
            result.duration.as_secs_f64()
        );
    }

    println!("=== Breakers ===");
    println!("{}", serde_json::to_string_pretty(&context.breakers().all_statistics())?);
    println!("=== Errors ===");
    println!(
        "{}",
        serde_json::to_string_pretty(&context.error_handler().get_error_statistics())?
    );

    Ok(())
}
