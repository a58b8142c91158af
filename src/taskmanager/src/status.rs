// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The per-instance task status field.
//!
//! Task status is a flat field on every instance rather than a strict
//! automaton. An operation raises an in-progress marker before it does any
//! work and performs a final write on every exit path, so no instance is left
//! on an in-progress marker once the operation returns. The two replication
//! error states are set only by the [`crate::topology`] controller and stay
//! in place until something outside the task manager clears them back to
//! [`TaskStatus::None`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug_span, warn};

use crate::error::Error;
use crate::instance::InstanceHandle;

/// The task currently running against an instance, if any.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// No task is pending.
    #[default]
    None,
    Building,
    /// Provisioning failed.
    BuildingError,
    Resizing,
    Rebooting,
    Restarting,
    Migrating,
    BackingUp,
    Configuring,
    Detaching,
    Promoting,
    Ejecting,
    Deleting,
    /// A promote-to-replica-source left this instance unreconciled.
    PromotionError,
    /// An eject-replica-source left this instance unreconciled.
    EjectionError,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::None => "NONE",
            TaskStatus::Building => "BUILDING",
            TaskStatus::BuildingError => "BUILDING_ERROR",
            TaskStatus::Resizing => "RESIZING",
            TaskStatus::Rebooting => "REBOOTING",
            TaskStatus::Restarting => "RESTARTING",
            TaskStatus::Migrating => "MIGRATING",
            TaskStatus::BackingUp => "BACKING_UP",
            TaskStatus::Configuring => "CONFIGURING",
            TaskStatus::Detaching => "DETACHING",
            TaskStatus::Promoting => "PROMOTING",
            TaskStatus::Ejecting => "EJECTING",
            TaskStatus::Deleting => "DELETING",
            TaskStatus::PromotionError => "PROMOTION_ERROR",
            TaskStatus::EjectionError => "EJECTION_ERROR",
        }
    }

    /// Reports whether this status marks a task that is still running.
    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self,
            TaskStatus::None
                | TaskStatus::BuildingError
                | TaskStatus::PromotionError
                | TaskStatus::EjectionError
        )
    }

    /// Reports whether this status records a failed task that needs external
    /// attention.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TaskStatus::BuildingError | TaskStatus::PromotionError | TaskStatus::EjectionError
        )
    }

    /// Reports whether an instance whose status is `self` may be moved to
    /// `next`.
    ///
    /// `None` and the error states are final writes and are always accepted.
    /// Deletion may start from any state, since broken instances must remain
    /// deletable. Any other in-progress marker requires an idle instance (or
    /// one already carrying the same marker).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match next {
            TaskStatus::None | TaskStatus::Deleting => true,
            next if next.is_error() => true,
            next => *self == TaskStatus::None || *self == next,
        }
    }

    /// The final status written when the task marked by `self` completes
    /// successfully, or `None` if nothing is left to write to.
    pub fn success_status(&self) -> Option<TaskStatus> {
        match self {
            TaskStatus::Deleting => None,
            _ => Some(TaskStatus::None),
        }
    }

    /// The final status written when the task marked by `self` fails.
    pub fn failure_status(&self) -> TaskStatus {
        match self {
            TaskStatus::Building => TaskStatus::BuildingError,
            _ => TaskStatus::None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs `work` against `handle` bracketed by task status writes.
///
/// The instance is marked with `marker` first. Whatever `work` returns, a
/// final status is written afterwards: [`TaskStatus::success_status`] on
/// success and [`TaskStatus::failure_status`] on failure, except that an
/// instance that was in an error state before the task returns to it. When
/// both `work` and the final write fail, the error from `work` is returned.
///
/// If the returned future is dropped before `work` finishes, the failure
/// status is written from a spawned task instead.
pub async fn with_task_status<H, F, T>(
    handle: &Arc<H>,
    marker: TaskStatus,
    work: F,
) -> Result<T, Error>
where
    H: InstanceHandle + ?Sized + 'static,
    F: Future<Output = Result<T, Error>>,
{
    let prior = handle.record().task_status;
    let failed = if prior.is_error() {
        prior
    } else {
        marker.failure_status()
    };
    handle.set_task_status(marker).await?;
    let guard = StatusGuard::new(vec![(Arc::clone(handle), failed)]);
    let result = work.await;
    guard.disarm();
    let settled = match &result {
        Ok(_) => marker.success_status(),
        Err(_) => Some(failed),
    };
    if let Some(status) = settled {
        if let Err(e) = handle.set_task_status(status).await {
            match result {
                Ok(_) => return Err(e),
                Err(_) => warn!(
                    instance_id = %handle.id(),
                    %status,
                    error = %e,
                    "unable to write final task status"
                ),
            }
        }
    }
    result
}

/// Writes fallback task statuses unless disarmed before it is dropped.
///
/// Armed once in-progress markers are written, so that a task whose future
/// is abandoned mid-flight does not leave its instances marked busy.
#[derive(Debug)]
pub(crate) struct StatusGuard<H: InstanceHandle + ?Sized + 'static> {
    pending: Vec<(Arc<H>, TaskStatus)>,
}

impl<H: InstanceHandle + ?Sized + 'static> StatusGuard<H> {
    pub(crate) fn new(pending: Vec<(Arc<H>, TaskStatus)>) -> StatusGuard<H> {
        StatusGuard { pending }
    }

    pub(crate) fn disarm(mut self) {
        self.pending.clear();
    }
}

impl<H: InstanceHandle + ?Sized + 'static> Drop for StatusGuard<H> {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    instances = pending.len(),
                    "no runtime left to settle task statuses of an abandoned task"
                );
                return;
            }
        };
        // Created outside the task to keep the caller's span as its parent.
        let settle_span = debug_span!("drop::settle_task_status");
        let _ = handle.spawn(
            async move {
                for (instance, status) in pending {
                    warn!(instance_id = %instance.id(), %status, "settling task status of an abandoned task");
                    if let Err(e) = instance.set_task_status(status).await {
                        warn!(
                            instance_id = %instance.id(),
                            %status,
                            error = %e,
                            "unable to settle task status"
                        );
                    }
                }
            }
            .instrument(settle_span),
        );
    }
}
