// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Replication topology changes.
//!
//! Both changes follow the same shape. First the write-capable source moves
//! to the new instance as quickly as possible, because until that finishes
//! the replica set has no working source and any failure is hard to recover
//! from. Once a working source with at least one working replica exists, the
//! remaining replicas are moved over one by one on a best-effort basis: a
//! replica that cannot be moved is recorded and skipped, never allowed to
//! abort the others.
//!
//! Failures are reported in two classes. A failure before the new source is
//! established marks every participant with the operation's error status and
//! returns the original error unchanged. A failure while moving the remaining
//! replicas marks exactly the participants that were not moved and returns
//! [`Error::ReplicaAttach`], which callers treat as a partial success that
//! needs manual reconciliation. A change whose future is dropped before it
//! settles is treated like a failure before the new source is established.
//!
//! Callers must not run two topology changes against the same replica set at
//! once; nothing here guards against it.

use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::TopologyConfig;
use crate::context::Context;
use crate::error::Error;
use crate::instance::{BuiltInstanceTasks, InstanceId, TxnId};
use crate::status::{StatusGuard, TaskStatus};

/// A replication topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyOperation {
    /// Planned failover: the old source stays reachable and is demoted.
    Promote,
    /// Unplanned failover: the old source is presumed lost.
    Eject,
}

impl TopologyOperation {
    /// The marker participants carry while the change runs.
    pub fn in_progress_status(&self) -> TaskStatus {
        match self {
            TopologyOperation::Promote => TaskStatus::Promoting,
            TopologyOperation::Eject => TaskStatus::Ejecting,
        }
    }

    /// The status left on participants the change could not reconcile.
    pub fn error_status(&self) -> TaskStatus {
        match self {
            TopologyOperation::Promote => TaskStatus::PromotionError,
            TopologyOperation::Eject => TaskStatus::EjectionError,
        }
    }
}

impl fmt::Display for TopologyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyOperation::Promote => f.write_str("promote-to-replica-source"),
            TopologyOperation::Eject => f.write_str("eject-replica-source"),
        }
    }
}

/// What failed for one participant after the new source was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A replica could not be moved from the old source to the new one.
    ReplicaMigration,
    /// The old source could not be stripped of its source role.
    SourceDemotion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub instance: InstanceId,
    pub kind: FailureKind,
    pub message: String,
}

/// Accumulates the per-participant failures of a topology change.
///
/// Append-only. Outcomes of the concurrently migrated replicas are folded in
/// after every attempt has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationFailures {
    failures: Vec<MigrationFailure>,
}

impl MigrationFailures {
    pub fn record(&mut self, instance: InstanceId, kind: FailureKind, error: &Error) {
        self.failures.push(MigrationFailure {
            instance,
            kind,
            message: error.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationFailure> {
        self.failures.iter()
    }

    pub fn contains(&self, instance: &InstanceId) -> bool {
        self.failures.iter().any(|f| &f.instance == instance)
    }

    /// The failed instances, sorted and without duplicates.
    pub fn instances(&self) -> Vec<InstanceId> {
        self.failures
            .iter()
            .map(|f| f.instance.clone())
            .sorted()
            .dedup()
            .collect()
    }

    /// Converts the failures into the error reported to the caller, if any.
    pub fn into_error(self, operation: TopologyOperation) -> Option<Error> {
        if self.is_empty() {
            return None;
        }
        Some(Error::ReplicaAttach {
            operation,
            instances: self.instances(),
        })
    }
}

/// A replication source and the replicas it had when the operation loaded
/// them.
#[derive(Debug, Clone)]
pub struct ReplicaSet {
    pub source: Arc<dyn BuiltInstanceTasks>,
    pub replicas: Vec<Arc<dyn BuiltInstanceTasks>>,
}

impl ReplicaSet {
    /// The source followed by every replica.
    pub fn participants(&self) -> impl Iterator<Item = &Arc<dyn BuiltInstanceTasks>> {
        std::iter::once(&self.source).chain(self.replicas.iter())
    }

    fn others<'a>(
        &'a self,
        candidate: &'a InstanceId,
    ) -> impl Iterator<Item = &'a Arc<dyn BuiltInstanceTasks>> + 'a {
        self.replicas.iter().filter(move |r| r.id() != candidate)
    }

    /// Checks that every participant may start `operation`, without changing
    /// anything.
    /// Marks every participant with the operation's error status if the
    /// change is abandoned before it settles.
    fn abandon_guard(&self, operation: TopologyOperation) -> StatusGuard<dyn BuiltInstanceTasks> {
        let status = operation.error_status();
        StatusGuard::new(
            self.participants()
                .map(|p| (Arc::clone(p), status))
                .collect(),
        )
    }

    fn validate(&self, operation: TopologyOperation) -> Result<(), Error> {
        let marker = operation.in_progress_status();
        for participant in self.participants() {
            let current = participant.record().task_status;
            if !current.can_transition_to(marker) {
                return Err(Error::InvalidTransition {
                    id: participant.id().clone(),
                    from: current,
                    to: marker,
                });
            }
        }
        Ok(())
    }
}

/// Sequences replication topology changes for one caller.
#[derive(Debug)]
pub struct TopologyController<'a> {
    ctx: &'a Context,
    config: &'a TopologyConfig,
}

impl<'a> TopologyController<'a> {
    pub fn new(ctx: &'a Context, config: &'a TopologyConfig) -> TopologyController<'a> {
        TopologyController { ctx, config }
    }

    /// Makes `candidate` the source of `set`, demoting the old source to a
    /// replica of it.
    pub async fn promote_to_replica_source(
        &self,
        set: &ReplicaSet,
        candidate: &Arc<dyn BuiltInstanceTasks>,
    ) -> Result<(), Error> {
        let operation = TopologyOperation::Promote;
        set.validate(operation)?;
        let guard = set.abandon_guard(operation);
        let result = self.promote(set, candidate).await;
        let result = self.settle(set, operation, result).await;
        guard.disarm();
        result
    }

    /// Replaces the failed source of `set` with its most caught-up replica.
    /// Returns the id of the new source.
    ///
    /// The ejected source is never contacted, so its own record keeps its
    /// stale source role until it is reconciled outside of this call.
    pub async fn eject_replica_source(&self, set: &ReplicaSet) -> Result<InstanceId, Error> {
        let operation = TopologyOperation::Eject;
        set.validate(operation)?;
        let guard = set.abandon_guard(operation);
        let result = self.eject(set).await;
        let result = self.settle(set, operation, result).await;
        guard.disarm();
        result
    }

    async fn promote(
        &self,
        set: &ReplicaSet,
        candidate: &Arc<dyn BuiltInstanceTasks>,
    ) -> Result<(), Error> {
        let operation = TopologyOperation::Promote;
        let old = &set.source;
        self.set_status(set.participants(), operation.in_progress_status())
            .await?;

        old.make_read_only(true).await?;
        // Endpoints come off both hosts before either gets new ones, so no
        // address is ever reachable on two instances.
        let source_ips = old.detach_public_ips().await?;
        let candidate_ips = candidate.detach_public_ips().await?;
        let latest_txn = old.get_latest_txn_id().await?;
        debug!(%latest_txn, candidate = %candidate.id(), "waiting for candidate to catch up");
        self.wait_for_txn(&**candidate, &latest_txn).await?;
        candidate.detach_replica(&**old).await?;
        candidate.enable_as_master().await?;
        old.attach_replica(&**candidate).await?;
        candidate.attach_public_ips(&source_ips).await?;
        old.attach_public_ips(&candidate_ips).await?;
        candidate.make_read_only(false).await?;
        info!(
            old_source = %old.id(),
            new_source = %candidate.id(),
            "new replication source is writable"
        );

        let mut failures = self
            .migrate_replicas(set.others(candidate.id()), old, candidate, Some(&latest_txn))
            .await;
        if let Err(e) = old.demote_replication_master().await {
            warn!(old_source = %old.id(), error = %e, "unable to demote old replication source");
            failures.record(old.id().clone(), FailureKind::SourceDemotion, &e);
        }
        self.finish(set, operation, failures).await
    }

    async fn eject(&self, set: &ReplicaSet) -> Result<InstanceId, Error> {
        let operation = TopologyOperation::Eject;
        let old = &set.source;
        self.set_status(set.participants(), operation.in_progress_status())
            .await?;

        let candidate = self
            .select_candidate(&set.replicas)
            .await
            .ok_or_else(|| Error::NoEjectionCandidate(old.id().clone()))?;
        info!(old_source = %old.id(), candidate = %candidate.id(), "selected new replication source");

        let source_ips = old.detach_public_ips().await?;
        let candidate_ips = candidate.detach_public_ips().await?;
        candidate.detach_replica(&**old).await?;
        candidate.enable_as_master().await?;
        candidate.attach_public_ips(&source_ips).await?;
        old.attach_public_ips(&candidate_ips).await?;
        candidate.make_read_only(false).await?;
        info!(
            old_source = %old.id(),
            new_source = %candidate.id(),
            "new replication source is writable"
        );

        // The old source is unreachable, so there is nothing to catch up to.
        let failures = self
            .migrate_replicas(set.others(candidate.id()), old, candidate, None)
            .await;
        self.finish(set, operation, failures).await?;
        Ok(candidate.id().clone())
    }

    /// Picks the replica that has applied the most transactions.
    ///
    /// Replicas whose count cannot be read are not eligible. Ties go to the
    /// smallest instance id, so the choice does not depend on the order the
    /// replicas were loaded in. This is a heuristic: with the old source gone
    /// there is no way to tell which replica saw its latest transaction.
    pub async fn select_candidate<'b>(
        &self,
        replicas: &'b [Arc<dyn BuiltInstanceTasks>],
    ) -> Option<&'b Arc<dyn BuiltInstanceTasks>> {
        let mut best: Option<(u64, &Arc<dyn BuiltInstanceTasks>)> = None;
        for replica in replicas {
            let count = match replica.get_txn_count().await {
                Ok(count) => count,
                Err(e) => {
                    warn!(replica = %replica.id(), error = %e, "excluding replica from candidacy");
                    continue;
                }
            };
            let better = match best {
                None => true,
                Some((best_count, current)) => {
                    count > best_count || (count == best_count && replica.id() < current.id())
                }
            };
            if better {
                best = Some((count, replica));
            }
        }
        best.map(|(_, replica)| replica)
    }

    /// Moves every replica in `replicas` from `old` to `new`, waiting first
    /// for each to apply `catch_up` when given.
    ///
    /// Up to `replica_migration_concurrency` replicas move at once. The
    /// outcomes are only folded together once every attempt has finished.
    async fn migrate_replicas<'b>(
        &self,
        replicas: impl Iterator<Item = &'b Arc<dyn BuiltInstanceTasks>>,
        old: &Arc<dyn BuiltInstanceTasks>,
        new: &Arc<dyn BuiltInstanceTasks>,
        catch_up: Option<&TxnId>,
    ) -> MigrationFailures {
        let outcomes: Vec<(InstanceId, Result<(), Error>)> = stream::iter(replicas)
            .map(|replica| async move {
                let result = self.migrate_replica(&**replica, old, new, catch_up).await;
                (replica.id().clone(), result)
            })
            .buffer_unordered(self.config.replica_migration_concurrency.max(1))
            .collect()
            .await;

        let mut failures = MigrationFailures::default();
        for (replica, result) in outcomes {
            match result {
                Ok(()) => debug!(%replica, new_source = %new.id(), "replica moved"),
                Err(e) => {
                    warn!(
                        %replica,
                        old_source = %old.id(),
                        new_source = %new.id(),
                        error = %e,
                        "unable to move replica to new replication source"
                    );
                    failures.record(replica, FailureKind::ReplicaMigration, &e);
                }
            }
        }
        failures
    }

    async fn migrate_replica(
        &self,
        replica: &dyn BuiltInstanceTasks,
        old: &Arc<dyn BuiltInstanceTasks>,
        new: &Arc<dyn BuiltInstanceTasks>,
        catch_up: Option<&TxnId>,
    ) -> Result<(), Error> {
        if let Some(txn) = catch_up {
            self.wait_for_txn(replica, txn).await?;
        }
        replica.detach_replica(&**old).await?;
        replica.attach_replica(&**new).await
    }

    /// Waits for `replica` to apply `txn`, bounded by the configured timeout
    /// and the caller's cancellation.
    async fn wait_for_txn(&self, replica: &dyn BuiltInstanceTasks, txn: &TxnId) -> Result<(), Error> {
        let timeout = self.config.txn_wait_timeout;
        tokio::select! {
            biased;
            _ = self.ctx.cancellation().cancelled() => Err(Error::Cancelled(replica.id().clone())),
            result = tokio::time::timeout(timeout, replica.wait_for_txn(txn)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::TxnWaitTimeout {
                    id: replica.id().clone(),
                    txn: txn.clone(),
                    timeout,
                }),
            },
        }
    }

    /// Clears the in-progress marker on every participant, then marks the
    /// ones that failed.
    async fn finish(
        &self,
        set: &ReplicaSet,
        operation: TopologyOperation,
        failures: MigrationFailures,
    ) -> Result<(), Error> {
        self.set_status(set.participants(), TaskStatus::None).await?;
        let failed_ids = failures.instances();
        let Some(err) = failures.into_error(operation) else {
            return Ok(());
        };
        let failed = set.participants().filter(|p| failed_ids.contains(p.id()));
        self.set_status(failed, operation.error_status()).await?;
        Err(err)
    }

    /// Applies the error policy to the outcome of a topology change.
    async fn settle<T>(
        &self,
        set: &ReplicaSet,
        operation: TopologyOperation,
        result: Result<T, Error>,
    ) -> Result<T, Error> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_partial_success() => Err(e),
            Err(e) => {
                error!(
                    %operation,
                    source = %set.source.id(),
                    error = %e,
                    "replication topology change failed before completing"
                );
                let status = operation.error_status();
                for participant in set.participants() {
                    if let Err(write_err) = participant.set_task_status(status).await {
                        warn!(
                            instance_id = %participant.id(),
                            %status,
                            error = %write_err,
                            "unable to record failed topology change"
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn set_status<'b>(
        &self,
        instances: impl Iterator<Item = &'b Arc<dyn BuiltInstanceTasks>>,
        status: TaskStatus,
    ) -> Result<(), Error> {
        for instance in instances {
            instance.set_task_status(status).await?;
        }
        Ok(())
    }
}
