//! Queue command - priority scheduling demonstration
//!
//! Enqueues one task per priority level, in ascending priority, before the
//! manager starts, then reports the order in which they actually ran.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use claudectx_throttle::{QueueMetrics, RequestPriority, RequestQueueManager, DEFAULT_QUEUE};
use serde::Serialize;
use tracing::info;

use super::{print_queue_metrics, CliContext};

/// Demo tasks in the order they are enqueued
const DEMO_TASKS: [(&str, RequestPriority); 4] = [
    ("background sync", RequestPriority::Low),
    ("conversation export", RequestPriority::Normal),
    ("user search", RequestPriority::High),
    ("session refresh", RequestPriority::Critical),
];

/// Arguments for the queue subcommand
#[derive(Debug, clap::Args)]
pub struct QueueCommand {
    /// Concurrency cap for the demo queue
    #[arg(long, default_value_t = 1)]
    pub max_concurrent: usize,

    /// Simulated duration of every task in milliseconds
    #[arg(long, default_value_t = 200)]
    pub work_ms: u64,
}

/// One finished demo task
#[derive(Debug, Clone, Serialize)]
pub struct DemoRun {
    pub name: String,
    pub priority: RequestPriority,
}

impl QueueCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        info!(
            max_concurrent = self.max_concurrent,
            work_ms = self.work_ms,
            "Running queue demonstration"
        );

        let (order, metrics) =
            run_demo(self.max_concurrent, Duration::from_millis(self.work_ms)).await?;

        if ctx.format.is_json() {
            let json = serde_json::json!({
                "execution_order": order,
                "metrics": { DEFAULT_QUEUE: metrics },
            });
            formatter.print_json(&json);
            return Ok(());
        }

        formatter.success("Execution order");
        for (i, run) in order.iter().enumerate() {
            formatter.info(&format!("{}. {:<20} [{}]", i + 1, run.name, run.priority));
        }
        formatter.info("");
        print_queue_metrics(formatter.as_ref(), DEFAULT_QUEUE, &metrics);
        Ok(())
    }
}

/// Runs the demo tasks through a fresh manager and returns the run order.
pub async fn run_demo(
    max_concurrent: usize,
    work: Duration,
) -> Result<(Vec<DemoRun>, QueueMetrics)> {
    let manager = RequestQueueManager::new(max_concurrent).context("Invalid queue settings")?;
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for (name, priority) in DEMO_TASKS {
        let order = Arc::clone(&order);
        let handle = manager.enqueue(
            move || async move {
                if let Ok(mut order) = order.lock() {
                    order.push(DemoRun {
                        name: name.to_string(),
                        priority,
                    });
                }
                tokio::time::sleep(work).await;
                Ok(name)
            },
            priority,
            DEFAULT_QUEUE,
        )?;
        handles.push(handle);
    }

    manager.start()?;
    for handle in handles {
        handle.await?;
    }
    let metrics = manager.metrics(DEFAULT_QUEUE);
    manager.stop().await;

    let order = order
        .lock()
        .map(|order| order.clone())
        .unwrap_or_default();
    Ok((order, metrics))
}
