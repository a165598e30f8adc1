use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{PilotError, Result};
use crate::scenario::{CompiledPlan, GroupSpec, Step};
use crate::worker::runner::{VirtualUserGroup, VuContext, WorkloadFuture};

/// Build runnable groups from a compiled plan.
pub fn build_groups(plan: &CompiledPlan) -> Result<Vec<VirtualUserGroup>> {
    plan.groups.iter().map(build_group).collect()
}

fn build_group(spec: &GroupSpec) -> Result<VirtualUserGroup> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|e| PilotError::Internal(format!("http client for {}: {}", spec.name, e)))?;
    let program = Arc::new(GroupProgram {
        name: spec.name.clone(),
        iterations: spec.iterations,
        steps: spec.steps.clone(),
        client,
    });

    Ok(VirtualUserGroup {
        name: spec.name.clone(),
        concurrency: spec.concurrency,
        graphs: spec.graphs.clone(),
        workload: Arc::new(move |ctx| -> WorkloadFuture {
            let program = Arc::clone(&program);
            Box::pin(async move { program.run(ctx).await })
        }),
    })
}

struct GroupProgram {
    name: String,
    iterations: u64,
    steps: Vec<Step>,
    client: reqwest::Client,
}

impl GroupProgram {
    async fn run(&self, ctx: VuContext) {
        tracing::debug!(group = %self.name, instance = ctx.instance, "Virtual user started");
        for _ in 0..self.iterations {
            for step in &self.steps {
                if ctx.cancel.is_cancelled() {
                    tracing::debug!(group = %self.name, instance = ctx.instance, "Virtual user canceled");
                    return;
                }
                self.perform(step, &ctx).await;
            }
        }
    }

    async fn perform(&self, step: &Step, ctx: &VuContext) {
        match step {
            Step::Notify { metric, value } => self.notify(ctx, metric, *value),
            Step::Sleep { millis } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(*millis)) => {}
                    _ = ctx.cancel.cancelled() => {}
                }
            }
            Step::Http {
                url,
                method,
                latency,
                errors,
            } => {
                let method = method
                    .as_deref()
                    .and_then(|m| reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
                    .unwrap_or(reqwest::Method::GET);
                let started = Instant::now();
                let request = self.client.request(method, url.as_str()).send();
                let outcome = tokio::select! {
                    outcome = request => outcome,
                    _ = ctx.cancel.cancelled() => return,
                };
                let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

                let failed = match outcome {
                    Ok(response) => !response.status().is_success(),
                    Err(e) => {
                        tracing::debug!(group = %self.name, url = %url, error = %e, "Request failed");
                        true
                    }
                };
                if let Some(title) = latency {
                    self.notify(ctx, title, elapsed_ms);
                }
                if failed {
                    if let Some(title) = errors {
                        self.notify(ctx, title, 1);
                    }
                }
            }
        }
    }

    fn notify(&self, ctx: &VuContext, title: &str, value: i64) {
        if let Err(e) = ctx.runtime.notify(title, value) {
            tracing::warn!(
                group = %self.name,
                instance = ctx.instance,
                title,
                error = %e,
                "Metric update rejected"
            );
        }
    }
}
