// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Periodic maintenance run by the task manager itself.
//!
//! The only periodic task publishes an "exists" event for every managed
//! instance, which downstream usage accounting consumes. It runs with the
//! administrative context and only when configured.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeriodicConfig;
use crate::context::Context;
use crate::error::Error;

/// Publishes usage "exists" events for the fleet.
#[async_trait]
pub trait ExistsEventPublisher: fmt::Debug + Send + Sync {
    /// Publishes one event per managed instance and returns how many were
    /// published.
    async fn publish_exists_events(&self, admin: &Context) -> Result<usize, Error>;
}

/// Owns the task running the periodic hook. The task stops when this handle
/// is dropped.
#[derive(Debug)]
pub struct PeriodicTasks {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PeriodicTasks {
    /// Stops the periodic task and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        let task = &mut self.task;
        if let Err(e) = task.await {
            warn!(error = %e, "periodic task runner did not exit cleanly");
        }
    }
}

impl Drop for PeriodicTasks {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Spawns the periodic hook, or returns `None` when it is not configured.
///
/// The hook ticks every `config.tick_interval`, skipping ticks it falls
/// behind on. Exists events are published on the first tick and after
/// every `exists_notification_ticks` skipped ticks from then on. A failed
/// publication is logged and retried on the next scheduled run.
pub fn spawn_periodic_tasks(
    config: &PeriodicConfig,
    admin: Context,
    publisher: Option<Arc<dyn ExistsEventPublisher>>,
) -> Option<PeriodicTasks> {
    let ticks_between_runs = config.exists_notification_ticks?;
    let publisher = publisher?;
    let tick_interval = config.tick_interval;
    let shutdown = CancellationToken::new();
    let cancelled = shutdown.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut ticks_to_skip = 0;

        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = interval.tick() => {
                    if ticks_to_skip > 0 {
                        ticks_to_skip -= 1;
                        continue;
                    }
                    ticks_to_skip = ticks_between_runs;
                    match publisher.publish_exists_events(&admin).await {
                        Ok(count) => debug!(count, "published exists events"),
                        Err(e) => warn!(error = %e, "unable to publish exists events"),
                    }
                }
            }
        }

        info!("shutting down periodic task runner");
    });

    Some(PeriodicTasks { shutdown, task })
}
