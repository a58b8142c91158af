// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Managed instances and the capabilities the task manager drives them with.
//!
//! The task manager does not execute anything on database hosts itself. It
//! loads a task handle for each instance it touches and sequences calls
//! against it. Handles are ephemeral: [`InstanceTasksProvider`] builds a new
//! one from durable state on every load, and a handle is never reused across
//! operations.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use derivative::Derivative;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::Error;
use crate::status::TaskStatus;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> $name {
                $name(s.into())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> $name {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Identifies a managed database instance.
    InstanceId
);
string_id!(
    /// Identifies a cluster of instances.
    ClusterId
);
string_id!(
    /// Identifies a backup artifact or a transient snapshot.
    BackupId
);
string_id!(
    /// An opaque, datastore-defined transaction identifier.
    ///
    /// Only the guest can compare two identifiers; the task manager passes
    /// them from one instance to another without looking inside.
    TxnId
);

/// An instance's role within its replica set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    #[default]
    None,
    Master,
    Slave,
}

/// The durable record of a managed instance, as loaded at the start of an
/// operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub datastore_manager: String,
    #[serde(default)]
    pub task_status: TaskStatus,
    #[serde(default)]
    pub role: ReplicationRole,
    /// The replication source this instance applies changes from. This is a
    /// relation only; the source does not own the replica.
    #[serde(default)]
    pub slave_of_id: Option<InstanceId>,
    /// The replicas applying changes from this instance, derived at load time
    /// from the other records' `slave_of_id`.
    #[serde(default, skip_serializing)]
    pub replicas: BTreeSet<InstanceId>,
    #[serde(default)]
    pub public_ips: Vec<String>,
    /// The compute server backing the instance. Absent until provisioning
    /// has created it.
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub volume_id: Option<String>,
    #[serde(default)]
    pub volume_size: Option<u64>,
    #[serde(default)]
    pub flavor_id: Option<String>,
    #[serde(default)]
    pub configuration_id: Option<String>,
}

impl InstanceRecord {
    /// Returns an unprovisioned record with the given id.
    pub fn new(id: impl Into<InstanceId>) -> InstanceRecord {
        let id = id.into();
        InstanceRecord {
            name: id.to_string(),
            id,
            tenant_id: String::new(),
            datastore_manager: String::new(),
            task_status: TaskStatus::None,
            role: ReplicationRole::None,
            slave_of_id: None,
            replicas: BTreeSet::new(),
            public_ips: Vec::new(),
            server_id: None,
            volume_id: None,
            volume_size: None,
            flavor_id: None,
            configuration_id: None,
        }
    }

    /// Reports whether provisioning created the backing server.
    pub fn is_provisioned(&self) -> bool {
        self.server_id.is_some()
    }

    /// Reports whether the record claims the source role while also
    /// replicating from another instance.
    pub fn has_conflicting_role(&self) -> bool {
        self.role == ReplicationRole::Master && self.slave_of_id.is_some()
    }
}

/// The durable record of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    #[serde(default)]
    pub name: String,
    /// Selects the strategy that supplies the cluster's [`ClusterTasks`].
    pub datastore_manager: String,
    #[serde(default)]
    pub instances: Vec<InstanceId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub id: String,
    #[serde(default)]
    pub ram_mb: u64,
    #[serde(default)]
    pub vcpus: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: BackupId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// The backup an incremental backup builds on.
    #[serde(default)]
    pub parent_id: Option<BackupId>,
}

/// A point-in-time snapshot of a replication source, taken to seed a new
/// replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSnapshot {
    /// The transient backup holding the snapshot's data set.
    pub snapshot_id: BackupId,
    pub source_id: InstanceId,
    /// Datastore-specific replication coordinates of the snapshot.
    #[serde(default)]
    pub log_position: Value,
}

/// Everything needed to provision a new instance.
#[derive(Derivative, Clone, PartialEq, Serialize, Deserialize)]
#[derivative(Debug)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub flavor: Flavor,
    pub image_id: String,
    #[serde(default)]
    pub databases: Vec<Value>,
    #[serde(default)]
    pub users: Vec<Value>,
    pub datastore_manager: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub volume_size: Option<u64>,
    /// Backup to restore the new instance from.
    #[serde(default)]
    pub backup_id: Option<BackupId>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[derivative(Debug = "ignore")]
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default)]
    pub nics: Vec<Value>,
    #[serde(default)]
    pub overrides: Option<Value>,
    /// Makes the new instance a replica of this source.
    #[serde(default)]
    pub slave_of_id: Option<InstanceId>,
    #[serde(default)]
    pub cluster_config: Option<Value>,
}

/// The primitives an instance task handle exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    SetTaskStatus,
    ResizeVolume,
    ResizeFlavor,
    Reboot,
    Restart,
    Migrate,
    DeleteAsync,
    CreateBackup,
    CreateInstance,
    GetReplicationMasterSnapshot,
    AttachReplicationSlave,
    UpdateOverrides,
    UnassignConfiguration,
    MakeReadOnly,
    DetachPublicIps,
    AttachPublicIps,
    GetLatestTxnId,
    GetTxnCount,
    WaitForTxn,
    DetachReplica,
    AttachReplica,
    EnableAsMaster,
    DemoteReplicationMaster,
}

impl Primitive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::SetTaskStatus => "set_task_status",
            Primitive::ResizeVolume => "resize_volume",
            Primitive::ResizeFlavor => "resize_flavor",
            Primitive::Reboot => "reboot",
            Primitive::Restart => "restart",
            Primitive::Migrate => "migrate",
            Primitive::DeleteAsync => "delete_async",
            Primitive::CreateBackup => "create_backup",
            Primitive::CreateInstance => "create_instance",
            Primitive::GetReplicationMasterSnapshot => "get_replication_master_snapshot",
            Primitive::AttachReplicationSlave => "attach_replication_slave",
            Primitive::UpdateOverrides => "update_overrides",
            Primitive::UnassignConfiguration => "unassign_configuration",
            Primitive::MakeReadOnly => "make_read_only",
            Primitive::DetachPublicIps => "detach_public_ips",
            Primitive::AttachPublicIps => "attach_public_ips",
            Primitive::GetLatestTxnId => "get_latest_txn_id",
            Primitive::GetTxnCount => "get_txn_count",
            Primitive::WaitForTxn => "wait_for_txn",
            Primitive::DetachReplica => "detach_replica",
            Primitive::AttachReplica => "attach_replica",
            Primitive::EnableAsMaster => "enable_as_master",
            Primitive::DemoteReplicationMaster => "demote_replication_master",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task handle bound to one instance for the duration of one operation.
#[async_trait]
pub trait InstanceHandle: fmt::Debug + Send + Sync {
    /// The instance's durable state as of the load that produced this handle.
    fn record(&self) -> &InstanceRecord;

    fn id(&self) -> &InstanceId {
        &self.record().id
    }

    /// Persists a new task status for the instance.
    async fn set_task_status(&self, status: TaskStatus) -> Result<(), Error>;
}

/// Task handle for an instance whose provisioning has completed.
#[async_trait]
pub trait BuiltInstanceTasks: InstanceHandle {
    async fn resize_volume(&self, new_size: u64) -> Result<(), Error>;

    async fn resize_flavor(&self, old_flavor: &Flavor, new_flavor: &Flavor) -> Result<(), Error>;

    async fn reboot(&self) -> Result<(), Error>;

    async fn restart(&self) -> Result<(), Error>;

    /// Moves the instance to another compute host, or lets the scheduler pick
    /// one when `host` is `None`.
    async fn migrate(&self, host: Option<&str>) -> Result<(), Error>;

    /// Starts tearing the instance down. Completes once deletion is under way;
    /// the record disappears when it finishes.
    async fn delete_async(&self) -> Result<(), Error>;

    async fn create_backup(&self, info: &BackupInfo) -> Result<(), Error>;

    async fn update_overrides(&self, overrides: &Value) -> Result<(), Error>;

    async fn unassign_configuration(
        &self,
        flavor: &Flavor,
        configuration_id: &str,
    ) -> Result<(), Error>;

    /// Toggles whether the datastore accepts writes.
    async fn make_read_only(&self, read_only: bool) -> Result<(), Error>;

    /// Removes the instance's public endpoints and returns them.
    async fn detach_public_ips(&self) -> Result<Vec<String>, Error>;

    async fn attach_public_ips(&self, ips: &[String]) -> Result<(), Error>;

    /// Returns the identifier of the last transaction this instance applied.
    async fn get_latest_txn_id(&self) -> Result<TxnId, Error>;

    /// Returns how many transactions this instance has applied.
    async fn get_txn_count(&self) -> Result<u64, Error>;

    /// Blocks until this instance has applied `txn`.
    ///
    /// This has no deadline of its own; callers bound it.
    async fn wait_for_txn(&self, txn: &TxnId) -> Result<(), Error>;

    /// Stops replicating from `source`.
    async fn detach_replica(&self, source: &dyn BuiltInstanceTasks) -> Result<(), Error>;

    /// Starts replicating from `source`.
    async fn attach_replica(&self, source: &dyn BuiltInstanceTasks) -> Result<(), Error>;

    /// Configures the instance to act as a replication source.
    async fn enable_as_master(&self) -> Result<(), Error>;

    /// Removes the replication-source configuration from the instance.
    async fn demote_replication_master(&self) -> Result<(), Error>;
}

/// Task handle for an instance that may not have finished provisioning.
#[async_trait]
pub trait FreshInstanceTasks: InstanceHandle {
    /// Provisions the instance. `backup_id` overrides `request.backup_id`
    /// when the data set comes from somewhere else, such as a replication
    /// snapshot.
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        backup_id: Option<&BackupId>,
        cluster_config: Option<&Value>,
    ) -> Result<(), Error>;

    /// Asks `source_id` for a snapshot to seed this instance from, optionally
    /// building on an existing backup.
    async fn get_replication_master_snapshot(
        &self,
        ctx: &Context,
        source_id: &InstanceId,
        backup_id: Option<&BackupId>,
    ) -> Result<ReplicationSnapshot, Error>;

    /// Starts replicating from the source the snapshot was taken from.
    async fn attach_replication_slave(
        &self,
        snapshot: &ReplicationSnapshot,
        flavor: &Flavor,
    ) -> Result<(), Error>;

    async fn delete_async(&self) -> Result<(), Error>;
}

/// Datastore-specific cluster operations.
#[async_trait]
pub trait ClusterTasks: fmt::Debug + Send + Sync {
    async fn create_cluster(&self, ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error>;

    async fn delete_cluster(&self, ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error>;
}

/// Loads task handles from durable state.
#[async_trait]
pub trait InstanceTasksProvider: fmt::Debug + Send + Sync {
    /// Loads a handle for a fully provisioned instance.
    ///
    /// Returns [`Error::Unprocessable`] when the instance exists but never
    /// finished provisioning.
    async fn load_built(
        &self,
        ctx: &Context,
        id: &InstanceId,
    ) -> Result<Arc<dyn BuiltInstanceTasks>, Error>;

    /// Loads a handle for an instance regardless of how far provisioning got.
    async fn load_fresh(
        &self,
        ctx: &Context,
        id: &InstanceId,
    ) -> Result<Arc<dyn FreshInstanceTasks>, Error>;

    async fn load_cluster(&self, ctx: &Context, id: &ClusterId) -> Result<ClusterRecord, Error>;
}

/// The backup subsystem.
#[async_trait]
pub trait BackupStore: fmt::Debug + Send + Sync {
    /// Deletes a backup artifact and its record.
    async fn delete(&self, ctx: &Context, backup_id: &BackupId) -> Result<(), Error>;
}
