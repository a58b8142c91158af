// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The task manager.

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{Instrument, debug_span, info, warn};

use crate::config::TaskManagerConfig;
use crate::context::Context;
use crate::error::Error;
use crate::instance::{
    BackupId, BackupInfo, BackupStore, BuiltInstanceTasks, ClusterId, ClusterTasks,
    CreateInstanceRequest, Flavor, FreshInstanceTasks, InstanceId, InstanceTasksProvider,
};
use crate::periodic::{self, ExistsEventPublisher, PeriodicTasks};
use crate::status::{TaskStatus, with_task_status};
use crate::strategy::{self, StrategyProvider};
use crate::topology::{ReplicaSet, TopologyController};

/// Entry point for every orchestrated operation.
///
/// Each operation loads fresh task handles for its targets and delegates to
/// them, to the [`TopologyController`] for replication topology changes, or
/// to a datastore strategy. Operations return once the work has been carried
/// out or has failed; the outcome is also recorded in the targets' durable
/// task status.
#[derive(Debug)]
pub struct TaskManager {
    config: TaskManagerConfig,
    admin_context: Context,
    instances: Arc<dyn InstanceTasksProvider>,
    backups: Arc<dyn BackupStore>,
    strategies: Arc<dyn StrategyProvider>,
    exists_publisher: Option<Arc<dyn ExistsEventPublisher>>,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        instances: Arc<dyn InstanceTasksProvider>,
        backups: Arc<dyn BackupStore>,
        strategies: Arc<dyn StrategyProvider>,
    ) -> TaskManager {
        let admin_context = Context::admin(&config.admin);
        TaskManager {
            config,
            admin_context,
            instances,
            backups,
            strategies,
            exists_publisher: None,
        }
    }

    /// Supplies the publisher used by the periodic exists-event hook.
    pub fn with_exists_publisher(mut self, publisher: Arc<dyn ExistsEventPublisher>) -> TaskManager {
        self.exists_publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    /// The identity used for work the task manager starts on its own.
    pub fn admin_context(&self) -> &Context {
        &self.admin_context
    }

    /// Starts the periodic maintenance hook, if configured.
    pub fn spawn_periodic_tasks(&self) -> Option<PeriodicTasks> {
        periodic::spawn_periodic_tasks(
            &self.config.periodic,
            self.admin_context.clone(),
            self.exists_publisher.clone(),
        )
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, new_size = new_size))]
    pub async fn resize_volume(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        new_size: u64,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(
            &instance,
            TaskStatus::Resizing,
            instance.resize_volume(new_size),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, old_flavor = %old_flavor.id, new_flavor = %new_flavor.id))]
    pub async fn resize_flavor(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        old_flavor: &Flavor,
        new_flavor: &Flavor,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(
            &instance,
            TaskStatus::Resizing,
            instance.resize_flavor(old_flavor, new_flavor),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn reboot(&self, ctx: &Context, instance_id: &InstanceId) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(&instance, TaskStatus::Rebooting, instance.reboot()).await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn restart(&self, ctx: &Context, instance_id: &InstanceId) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(&instance, TaskStatus::Restarting, instance.restart()).await
    }

    /// Moves an instance to another compute host.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, host = ?host))]
    pub async fn migrate(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        host: Option<&str>,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(&instance, TaskStatus::Migrating, instance.migrate(host)).await
    }

    /// Stops a replica from replicating from its source.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn detach_replica(&self, ctx: &Context, instance_id: &InstanceId) -> Result<(), Error> {
        let replica = self.instances.load_built(ctx, instance_id).await?;
        let source_id = replica_source(&*replica)?;
        let source = self.instances.load_built(ctx, &source_id).await?;
        with_task_status(
            &replica,
            TaskStatus::Detaching,
            replica.detach_replica(&*source),
        )
        .await
    }

    /// Makes the replica `instance_id` the source of its replica set in a
    /// planned failover.
    ///
    /// Returns [`Error::ReplicaAttach`] when the new source is working but
    /// some participants could not be moved over; see [`crate::topology`].
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn promote_to_replica_source(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let candidate = self.instances.load_built(ctx, instance_id).await?;
        let source_id = replica_source(&*candidate)?;
        let source = self.instances.load_built(ctx, &source_id).await?;
        if !source.record().replicas.contains(instance_id) {
            return Err(Error::Unprocessable {
                id: instance_id.clone(),
                reason: format!("not listed among the replicas of {source_id}"),
            });
        }
        let mut replicas = Vec::with_capacity(source.record().replicas.len());
        for replica_id in &source.record().replicas {
            if replica_id == instance_id {
                replicas.push(Arc::clone(&candidate));
            } else {
                replicas.push(self.instances.load_built(ctx, replica_id).await?);
            }
        }
        let set = ReplicaSet { source, replicas };
        TopologyController::new(ctx, &self.config.topology)
            .promote_to_replica_source(&set, &candidate)
            .await
    }

    /// Replaces the failed source `instance_id` with its most caught-up
    /// replica.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn eject_replica_source(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let source = self.instances.load_built(ctx, instance_id).await?;
        let mut replicas = Vec::with_capacity(source.record().replicas.len());
        for replica_id in &source.record().replicas {
            replicas.push(self.instances.load_built(ctx, replica_id).await?);
        }
        let set = ReplicaSet { source, replicas };
        let new_source = TopologyController::new(ctx, &self.config.topology)
            .eject_replica_source(&set)
            .await?;
        info!(%new_source, "ejected replication source");
        Ok(())
    }

    /// Deletes an instance, including one whose provisioning never finished.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn delete_instance(&self, ctx: &Context, instance_id: &InstanceId) -> Result<(), Error> {
        match self.instances.load_built(ctx, instance_id).await {
            Ok(instance) => {
                with_task_status(&instance, TaskStatus::Deleting, instance.delete_async()).await
            }
            Err(e) if e.is_unprocessable() => {
                info!(error = %e, "instance is not fully provisioned; deleting what exists");
                let instance = self.instances.load_fresh(ctx, instance_id).await?;
                with_task_status(&instance, TaskStatus::Deleting, instance.delete_async()).await
            }
            Err(e) => Err(e),
        }
    }

    #[tracing::instrument(skip_all, fields(backup_id = %backup_id))]
    pub async fn delete_backup(&self, ctx: &Context, backup_id: &BackupId) -> Result<(), Error> {
        self.backups.delete(ctx, backup_id).await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, backup_id = %backup_info.id))]
    pub async fn create_backup(
        &self,
        ctx: &Context,
        backup_info: &BackupInfo,
        instance_id: &InstanceId,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(
            &instance,
            TaskStatus::BackingUp,
            instance.create_backup(backup_info),
        )
        .await
    }

    /// Provisions a new instance, bootstrapping it as a replica when
    /// `request.slave_of_id` is set.
    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, slave_of_id = ?request.slave_of_id))]
    pub async fn create_instance(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        request: &CreateInstanceRequest,
    ) -> Result<(), Error> {
        let instance = self.instances.load_fresh(ctx, instance_id).await?;
        let work = async {
            match &request.slave_of_id {
                Some(source_id) => {
                    self.create_replication_slave(ctx, &*instance, request, source_id)
                        .await
                }
                None => {
                    instance
                        .create_instance(
                            request,
                            request.backup_id.as_ref(),
                            request.cluster_config.as_ref(),
                        )
                        .await
                }
            }
        };
        with_task_status(&instance, TaskStatus::Building, work).await
    }

    /// Seeds `instance` from a snapshot of `source_id` and attaches it as a
    /// replica.
    ///
    /// The snapshot only exists to seed this instance and is deleted as soon
    /// as provisioning is over, whether or not provisioning succeeded.
    async fn create_replication_slave(
        &self,
        ctx: &Context,
        instance: &dyn FreshInstanceTasks,
        request: &CreateInstanceRequest,
        source_id: &InstanceId,
    ) -> Result<(), Error> {
        let snapshot = instance
            .get_replication_master_snapshot(ctx, source_id, request.backup_id.as_ref())
            .await?;
        let lease = TransientSnapshot::new(
            Arc::clone(&self.backups),
            ctx.clone(),
            snapshot.snapshot_id.clone(),
        );
        let provisioned = instance
            .create_instance(request, Some(&snapshot.snapshot_id), None)
            .await;
        let released = lease.release().await;
        match (provisioned, released) {
            (Ok(()), Ok(())) => {}
            (Err(e), Ok(())) | (Ok(()), Err(e)) => return Err(e),
            (Err(e), Err(release_err)) => {
                warn!(
                    snapshot_id = %snapshot.snapshot_id,
                    error = %release_err,
                    "unable to delete replication snapshot"
                );
                return Err(e);
            }
        }
        instance
            .attach_replication_slave(&snapshot, &request.flavor)
            .await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn update_overrides(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        overrides: &Value,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(
            &instance,
            TaskStatus::Configuring,
            instance.update_overrides(overrides),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(instance_id = %instance_id, configuration_id = %configuration_id))]
    pub async fn unassign_configuration(
        &self,
        ctx: &Context,
        instance_id: &InstanceId,
        flavor: &Flavor,
        configuration_id: &str,
    ) -> Result<(), Error> {
        let instance = self.instances.load_built(ctx, instance_id).await?;
        with_task_status(
            &instance,
            TaskStatus::Configuring,
            instance.unassign_configuration(flavor, configuration_id),
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn create_cluster(&self, ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error> {
        let tasks = self.load_cluster_tasks(ctx, cluster_id).await?;
        tasks.create_cluster(ctx, cluster_id).await
    }

    #[tracing::instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn delete_cluster(&self, ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error> {
        let tasks = self.load_cluster_tasks(ctx, cluster_id).await?;
        tasks.delete_cluster(ctx, cluster_id).await
    }

    /// Resolves the cluster tasks of the cluster's datastore.
    async fn load_cluster_tasks(
        &self,
        ctx: &Context,
        cluster_id: &ClusterId,
    ) -> Result<Arc<dyn ClusterTasks>, Error> {
        let cluster = self.instances.load_cluster(ctx, cluster_id).await?;
        let manager = cluster.datastore_manager;
        let strategy = self
            .strategies
            .load_strategy(&manager)
            .ok_or_else(|| Error::NoStrategy(manager.clone()))?;
        strategy
            .cluster_tasks()
            .cloned()
            .ok_or(Error::NoClusterTasks(manager))
    }

    /// Runs the datastore strategy action named `name`.
    #[tracing::instrument(skip_all, fields(name = %name))]
    pub async fn call_strategy(&self, ctx: &Context, name: &str, args: Value) -> Result<(), Error> {
        let resolved = strategy::resolve(&*self.strategies, name)?;
        resolved.action.call(ctx, args).await
    }

    /// Runs the operation `name` with JSON-encoded arguments.
    ///
    /// Built-in operation names take precedence; any other name is resolved
    /// as a datastore strategy action.
    pub async fn dispatch(&self, ctx: &Context, name: &str, args: Value) -> Result<(), Error> {
        match name {
            "resize_volume" => {
                let a: ResizeVolumeArgs = parse_args(name, args)?;
                self.resize_volume(ctx, &a.instance_id, a.new_size).await
            }
            "resize_flavor" => {
                let a: ResizeFlavorArgs = parse_args(name, args)?;
                self.resize_flavor(ctx, &a.instance_id, &a.old_flavor, &a.new_flavor)
                    .await
            }
            "reboot" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.reboot(ctx, &a.instance_id).await
            }
            "restart" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.restart(ctx, &a.instance_id).await
            }
            "migrate" => {
                let a: MigrateArgs = parse_args(name, args)?;
                self.migrate(ctx, &a.instance_id, a.host.as_deref()).await
            }
            "detach_replica" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.detach_replica(ctx, &a.instance_id).await
            }
            "promote_to_replica_source" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.promote_to_replica_source(ctx, &a.instance_id).await
            }
            "eject_replica_source" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.eject_replica_source(ctx, &a.instance_id).await
            }
            "delete_instance" => {
                let a: InstanceArgs = parse_args(name, args)?;
                self.delete_instance(ctx, &a.instance_id).await
            }
            "delete_backup" => {
                let a: BackupArgs = parse_args(name, args)?;
                self.delete_backup(ctx, &a.backup_id).await
            }
            "create_backup" => {
                let a: CreateBackupArgs = parse_args(name, args)?;
                self.create_backup(ctx, &a.backup_info, &a.instance_id).await
            }
            "create_instance" => {
                let a: CreateInstanceArgs = parse_args(name, args)?;
                self.create_instance(ctx, &a.instance_id, &a.request).await
            }
            "update_overrides" => {
                let a: UpdateOverridesArgs = parse_args(name, args)?;
                self.update_overrides(ctx, &a.instance_id, &a.overrides)
                    .await
            }
            "unassign_configuration" => {
                let a: UnassignConfigurationArgs = parse_args(name, args)?;
                self.unassign_configuration(ctx, &a.instance_id, &a.flavor, &a.configuration_id)
                    .await
            }
            "create_cluster" => {
                let a: ClusterArgs = parse_args(name, args)?;
                self.create_cluster(ctx, &a.cluster_id).await
            }
            "delete_cluster" => {
                let a: ClusterArgs = parse_args(name, args)?;
                self.delete_cluster(ctx, &a.cluster_id).await
            }
            _ => self.call_strategy(ctx, name, args).await,
        }
    }
}

fn replica_source(replica: &dyn BuiltInstanceTasks) -> Result<InstanceId, Error> {
    replica
        .record()
        .slave_of_id
        .clone()
        .ok_or_else(|| Error::Unprocessable {
            id: replica.id().clone(),
            reason: "instance is not a replica".into(),
        })
}

fn parse_args<T: DeserializeOwned>(operation: &str, args: Value) -> Result<T, Error> {
    serde_json::from_value(args).map_err(|source| Error::InvalidArguments {
        operation: operation.into(),
        source,
    })
}

/// A snapshot that must be deleted once its consumer is done with it.
///
/// [`TransientSnapshot::release`] deletes it. If the owning future is dropped
/// or unwinds before that, the deletion is handed to the runtime instead, so
/// the snapshot is deleted exactly once on every path.
#[derive(Debug)]
struct TransientSnapshot {
    backups: Arc<dyn BackupStore>,
    ctx: Context,
    id: Option<BackupId>,
}

impl TransientSnapshot {
    fn new(backups: Arc<dyn BackupStore>, ctx: Context, id: BackupId) -> TransientSnapshot {
        TransientSnapshot {
            backups,
            ctx,
            id: Some(id),
        }
    }

    async fn release(mut self) -> Result<(), Error> {
        let Some(id) = self.id.take() else {
            return Ok(());
        };
        self.backups.delete(&self.ctx, &id).await
    }
}

impl Drop for TransientSnapshot {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(snapshot_id = %id, "no runtime left to delete replication snapshot");
                return;
            }
        };
        let backups = Arc::clone(&self.backups);
        let ctx = self.ctx.clone();
        // Created outside the task to keep the caller's span as its parent.
        let release_span = debug_span!("drop::release_snapshot", snapshot_id = %id);
        let _ = handle.spawn(
            async move {
                if let Err(e) = backups.delete(&ctx, &id).await {
                    warn!(error = %e, "unable to delete replication snapshot");
                }
            }
            .instrument(release_span),
        );
    }
}

#[derive(Deserialize)]
struct InstanceArgs {
    instance_id: InstanceId,
}

#[derive(Deserialize)]
struct ResizeVolumeArgs {
    instance_id: InstanceId,
    new_size: u64,
}

#[derive(Deserialize)]
struct ResizeFlavorArgs {
    instance_id: InstanceId,
    old_flavor: Flavor,
    new_flavor: Flavor,
}

#[derive(Deserialize)]
struct MigrateArgs {
    instance_id: InstanceId,
    #[serde(default)]
    host: Option<String>,
}

#[derive(Deserialize)]
struct BackupArgs {
    backup_id: BackupId,
}

#[derive(Deserialize)]
struct CreateBackupArgs {
    instance_id: InstanceId,
    backup_info: BackupInfo,
}

#[derive(Deserialize)]
struct CreateInstanceArgs {
    instance_id: InstanceId,
    #[serde(flatten)]
    request: CreateInstanceRequest,
}

#[derive(Deserialize)]
struct UpdateOverridesArgs {
    instance_id: InstanceId,
    overrides: Value,
}

#[derive(Deserialize)]
struct UnassignConfigurationArgs {
    instance_id: InstanceId,
    flavor: Flavor,
    configuration_id: String,
}

#[derive(Deserialize)]
struct ClusterArgs {
    cluster_id: ClusterId,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::memory::MemoryFleet;

    use super::*;

    fn snapshot(fleet: &MemoryFleet, id: &str) -> TransientSnapshot {
        fleet.add_backup(BackupInfo {
            id: BackupId::from(id),
            name: id.into(),
            description: None,
            parent_id: None,
        });
        TransientSnapshot::new(
            Arc::new(fleet.clone()),
            Context::new("alice", "tenant"),
            BackupId::from(id),
        )
    }

    #[tokio::test]
    async fn released_snapshot_is_deleted_once() {
        let fleet = MemoryFleet::new();
        snapshot(&fleet, "snap").release().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(fleet.deleted_backups(), vec![BackupId::from("snap")]);
    }

    #[tokio::test]
    async fn abandoned_snapshot_is_deleted() {
        let fleet = MemoryFleet::new();
        let lease = snapshot(&fleet, "snap");
        let provisioning = async move {
            let _lease = lease;
            std::future::pending::<()>().await;
        };
        // Dropping the unfinished future abandons the snapshot.
        let timed_out = tokio::time::timeout(Duration::from_millis(10), provisioning).await;
        assert!(timed_out.is_err());
        tokio::task::yield_now().await;
        assert_eq!(fleet.deleted_backups(), vec![BackupId::from("snap")]);
        assert!(fleet.backup("snap").is_none());
    }
}
