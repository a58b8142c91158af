// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-process fleet.
//!
//! [`MemoryFleet`] keeps instance records, guest state, clusters and backups
//! in memory and implements every capability the task manager needs on top
//! of them. Failures can be injected per instance and primitive, and every
//! primitive call is logged, so tests can observe exactly what an operation
//! did.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::context::Context;
use crate::error::Error;
use crate::instance::{
    BackupId, BackupInfo, BackupStore, BuiltInstanceTasks, ClusterId, ClusterRecord,
    CreateInstanceRequest, Flavor, FreshInstanceTasks, InstanceHandle, InstanceId,
    InstanceRecord, InstanceTasksProvider, Primitive, ReplicationRole, ReplicationSnapshot, TxnId,
};
use crate::periodic::ExistsEventPublisher;
use crate::status::TaskStatus;

/// The datastore-side state of an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestState {
    pub read_only: bool,
    /// Whether the datastore is configured to serve replicas.
    pub master_enabled: bool,
    /// How many transactions the datastore has applied. Transaction ids are
    /// the decimal rendering of this count.
    pub txn_count: u64,
    pub overrides: Option<Value>,
}

/// One instance in a [`FleetSeed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedInstance {
    #[serde(flatten)]
    pub record: InstanceRecord,
    #[serde(flatten)]
    pub guest: GuestState,
}

/// The initial contents of a [`MemoryFleet`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSeed {
    pub instances: Vec<SeedInstance>,
    pub clusters: Vec<ClusterRecord>,
    pub backups: Vec<BackupInfo>,
}

#[derive(Debug, Default)]
struct FleetState {
    instances: BTreeMap<InstanceId, InstanceRecord>,
    guests: BTreeMap<InstanceId, GuestState>,
    clusters: BTreeMap<ClusterId, ClusterRecord>,
    backups: BTreeMap<BackupId, BackupInfo>,
    deleted_backups: Vec<BackupId>,
    faults: BTreeSet<(InstanceId, Primitive)>,
    stalled: BTreeSet<InstanceId>,
    calls: Vec<(InstanceId, Primitive)>,
    exists_events: Vec<InstanceId>,
    next_snapshot: u64,
    fail_backup_deletes: bool,
}

impl FleetState {
    /// Logs a primitive call and checks that it may proceed.
    fn enter(&mut self, id: &InstanceId, primitive: Primitive) -> Result<(), Error> {
        self.calls.push((id.clone(), primitive));
        if !self.instances.contains_key(id) {
            return Err(Error::InstanceNotFound(id.clone()));
        }
        if self.faults.contains(&(id.clone(), primitive)) {
            return Err(guest_error(id, primitive, "injected failure"));
        }
        Ok(())
    }

    fn record_mut(&mut self, id: &InstanceId) -> Result<&mut InstanceRecord, Error> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| Error::InstanceNotFound(id.clone()))
    }

    fn guest_mut(&mut self, id: &InstanceId) -> &mut GuestState {
        self.guests.entry(id.clone()).or_default()
    }

    /// Returns the record of `id` with its replicas filled in.
    fn load(&self, id: &InstanceId) -> Option<InstanceRecord> {
        let mut record = self.instances.get(id)?.clone();
        record.replicas = self
            .instances
            .values()
            .filter(|r| r.slave_of_id.as_ref() == Some(id))
            .map(|r| r.id.clone())
            .collect();
        Some(record)
    }

    fn endpoint_owner(&self, ip: &str) -> Option<&InstanceId> {
        self.instances
            .values()
            .find(|r| r.public_ips.iter().any(|owned| owned == ip))
            .map(|r| &r.id)
    }
}

fn guest_error(id: &InstanceId, primitive: Primitive, message: impl Into<String>) -> Error {
    Error::Guest {
        id: id.clone(),
        primitive,
        message: message.into(),
    }
}

/// An in-memory fleet of instances. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryFleet {
    state: Arc<Mutex<FleetState>>,
}

impl MemoryFleet {
    pub fn new() -> MemoryFleet {
        MemoryFleet::default()
    }

    pub fn from_seed(seed: FleetSeed) -> MemoryFleet {
        let fleet = MemoryFleet::new();
        {
            let mut state = fleet.lock();
            for SeedInstance { mut record, guest } in seed.instances {
                record.replicas.clear();
                state.guests.insert(record.id.clone(), guest);
                state.instances.insert(record.id.clone(), record);
            }
            for cluster in seed.clusters {
                state.clusters.insert(cluster.id.clone(), cluster);
            }
            for backup in seed.backups {
                state.backups.insert(backup.id.clone(), backup);
            }
        }
        fleet
    }

    pub fn from_json(json: &str) -> Result<MemoryFleet, serde_json::Error> {
        Ok(MemoryFleet::from_seed(serde_json::from_str(json)?))
    }

    /// Builds a fleet holding one provisioned replica set: `source` with a
    /// public endpoint, and every instance in `replicas` replicating from it
    /// with an endpoint of its own.
    pub fn replica_set(source: &str, replicas: &[&str]) -> MemoryFleet {
        let fleet = MemoryFleet::new();
        let source_id = InstanceId::from(source);
        let mut source_record = provisioned_record(source, "10.0.0.1");
        source_record.role = ReplicationRole::Master;
        fleet.insert(
            source_record,
            GuestState {
                master_enabled: true,
                ..Default::default()
            },
        );
        for (i, replica) in replicas.iter().enumerate() {
            let mut record = provisioned_record(replica, &format!("10.0.0.{}", i + 2));
            record.role = ReplicationRole::Slave;
            record.slave_of_id = Some(source_id.clone());
            fleet.insert(
                record,
                GuestState {
                    read_only: true,
                    ..Default::default()
                },
            );
        }
        fleet
    }

    fn lock(&self) -> MutexGuard<'_, FleetState> {
        self.state.lock().expect("lock poisoned")
    }

    /// Adds or replaces an instance.
    pub fn insert(&self, record: InstanceRecord, guest: GuestState) {
        let mut state = self.lock();
        state.guests.insert(record.id.clone(), guest);
        state.instances.insert(record.id.clone(), record);
    }

    pub fn add_cluster(&self, cluster: ClusterRecord) {
        self.lock().clusters.insert(cluster.id.clone(), cluster);
    }

    pub fn add_backup(&self, backup: BackupInfo) {
        self.lock().backups.insert(backup.id.clone(), backup);
    }

    /// Makes every future call of `primitive` on `id` fail.
    pub fn fail(&self, id: impl Into<InstanceId>, primitive: Primitive) {
        self.lock().faults.insert((id.into(), primitive));
    }

    /// Removes a failure injected with [`MemoryFleet::fail`].
    pub fn heal(&self, id: impl Into<InstanceId>, primitive: Primitive) {
        self.lock().faults.remove(&(id.into(), primitive));
    }

    /// Makes backup deletions fail.
    pub fn fail_backup_deletes(&self, fail: bool) {
        self.lock().fail_backup_deletes = fail;
    }

    /// Makes `id` stop applying transactions: waits on it never finish.
    pub fn stall_txn(&self, id: impl Into<InstanceId>) {
        self.lock().stalled.insert(id.into());
    }

    pub fn set_txn_count(&self, id: impl Into<InstanceId>, count: u64) {
        self.lock().guest_mut(&id.into()).txn_count = count;
    }

    pub fn set_task_status(&self, id: impl Into<InstanceId>, status: TaskStatus) {
        let id = id.into();
        if let Some(record) = self.lock().instances.get_mut(&id) {
            record.task_status = status;
        }
    }

    /// The current record of `id`, with its replicas filled in.
    pub fn instance(&self, id: impl Into<InstanceId>) -> Option<InstanceRecord> {
        self.lock().load(&id.into())
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        let state = self.lock();
        state
            .instances
            .keys()
            .filter_map(|id| state.load(id))
            .collect()
    }

    pub fn task_status(&self, id: impl Into<InstanceId>) -> Option<TaskStatus> {
        self.lock().instances.get(&id.into()).map(|r| r.task_status)
    }

    pub fn guest(&self, id: impl Into<InstanceId>) -> Option<GuestState> {
        self.lock().guests.get(&id.into()).cloned()
    }

    pub fn backup(&self, id: impl Into<BackupId>) -> Option<BackupInfo> {
        self.lock().backups.get(&id.into()).cloned()
    }

    /// Every backup deleted so far, in deletion order.
    pub fn deleted_backups(&self) -> Vec<BackupId> {
        self.lock().deleted_backups.clone()
    }

    /// Every primitive called on `id` so far, in call order.
    pub fn calls_to(&self, id: impl Into<InstanceId>) -> Vec<Primitive> {
        let id = id.into();
        self.lock()
            .calls
            .iter()
            .filter(|(target, _)| *target == id)
            .map(|(_, primitive)| *primitive)
            .collect()
    }

    pub fn exists_events(&self) -> Vec<InstanceId> {
        self.lock().exists_events.clone()
    }

    fn handle(&self, record: InstanceRecord) -> Arc<MemoryInstanceTasks> {
        Arc::new(MemoryInstanceTasks {
            fleet: self.clone(),
            record,
        })
    }
}

fn provisioned_record(id: &str, ip: &str) -> InstanceRecord {
    let mut record = InstanceRecord::new(id);
    record.tenant_id = "tenant".into();
    record.datastore_manager = "mysql".into();
    record.public_ips = vec![ip.into()];
    record.server_id = Some(format!("server-{id}"));
    record.volume_id = Some(format!("volume-{id}"));
    record.volume_size = Some(10);
    record.flavor_id = Some("small".into());
    record
}

#[async_trait]
impl InstanceTasksProvider for MemoryFleet {
    async fn load_built(
        &self,
        _ctx: &Context,
        id: &InstanceId,
    ) -> Result<Arc<dyn BuiltInstanceTasks>, Error> {
        let record = self
            .lock()
            .load(id)
            .ok_or_else(|| Error::InstanceNotFound(id.clone()))?;
        if !record.is_provisioned() {
            return Err(Error::Unprocessable {
                id: id.clone(),
                reason: "instance has no server".into(),
            });
        }
        Ok(self.handle(record))
    }

    async fn load_fresh(
        &self,
        _ctx: &Context,
        id: &InstanceId,
    ) -> Result<Arc<dyn FreshInstanceTasks>, Error> {
        let record = self
            .lock()
            .load(id)
            .ok_or_else(|| Error::InstanceNotFound(id.clone()))?;
        Ok(self.handle(record))
    }

    async fn load_cluster(&self, _ctx: &Context, id: &ClusterId) -> Result<ClusterRecord, Error> {
        self.lock()
            .clusters
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound(id.clone()))
    }
}

#[async_trait]
impl BackupStore for MemoryFleet {
    async fn delete(&self, _ctx: &Context, backup_id: &BackupId) -> Result<(), Error> {
        let mut state = self.lock();
        if state.fail_backup_deletes {
            return Err(Error::Backup {
                id: backup_id.clone(),
                message: "injected failure".into(),
            });
        }
        if state.backups.remove(backup_id).is_none() {
            return Err(Error::Backup {
                id: backup_id.clone(),
                message: "no such backup".into(),
            });
        }
        state.deleted_backups.push(backup_id.clone());
        Ok(())
    }
}

#[async_trait]
impl ExistsEventPublisher for MemoryFleet {
    async fn publish_exists_events(&self, admin: &Context) -> Result<usize, Error> {
        if !admin.is_admin {
            return Err(anyhow!("exists events require the administrative context").into());
        }
        let mut state = self.lock();
        let existing: Vec<_> = state
            .instances
            .values()
            .filter(|r| r.is_provisioned())
            .map(|r| r.id.clone())
            .collect();
        let count = existing.len();
        state.exists_events.extend(existing);
        Ok(count)
    }
}

/// A task handle over one instance of a [`MemoryFleet`].
///
/// Every primitive works on the fleet's current state, not on the record the
/// handle was loaded with.
#[derive(Debug)]
pub struct MemoryInstanceTasks {
    fleet: MemoryFleet,
    record: InstanceRecord,
}

impl MemoryInstanceTasks {
    /// Runs `f` against the fleet state after logging and checking the call.
    fn with_state<T>(
        &self,
        primitive: Primitive,
        f: impl FnOnce(&mut FleetState, &InstanceId) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let id = &self.record.id;
        let mut state = self.fleet.lock();
        state.enter(id, primitive)?;
        debug!(instance_id = %id, %primitive, "guest primitive");
        f(&mut state, id)
    }
}

#[async_trait]
impl InstanceHandle for MemoryInstanceTasks {
    fn record(&self) -> &InstanceRecord {
        &self.record
    }

    async fn set_task_status(&self, status: TaskStatus) -> Result<(), Error> {
        self.with_state(Primitive::SetTaskStatus, |state, id| {
            let record = state.record_mut(id)?;
            if !record.task_status.can_transition_to(status) {
                return Err(Error::InvalidTransition {
                    id: id.clone(),
                    from: record.task_status,
                    to: status,
                });
            }
            record.task_status = status;
            Ok(())
        })
    }
}

#[async_trait]
impl BuiltInstanceTasks for MemoryInstanceTasks {
    async fn resize_volume(&self, new_size: u64) -> Result<(), Error> {
        self.with_state(Primitive::ResizeVolume, |state, id| {
            let record = state.record_mut(id)?;
            if record.volume_size.is_some_and(|size| size > new_size) {
                return Err(guest_error(
                    id,
                    Primitive::ResizeVolume,
                    "volumes can only grow",
                ));
            }
            record.volume_size = Some(new_size);
            Ok(())
        })
    }

    async fn resize_flavor(&self, old_flavor: &Flavor, new_flavor: &Flavor) -> Result<(), Error> {
        self.with_state(Primitive::ResizeFlavor, |state, id| {
            let record = state.record_mut(id)?;
            if record.flavor_id.as_deref() != Some(old_flavor.id.as_str()) {
                return Err(guest_error(
                    id,
                    Primitive::ResizeFlavor,
                    format!("instance is not running flavor {}", old_flavor.id),
                ));
            }
            record.flavor_id = Some(new_flavor.id.clone());
            Ok(())
        })
    }

    async fn reboot(&self) -> Result<(), Error> {
        self.with_state(Primitive::Reboot, |_, _| Ok(()))
    }

    async fn restart(&self) -> Result<(), Error> {
        self.with_state(Primitive::Restart, |_, _| Ok(()))
    }

    async fn migrate(&self, host: Option<&str>) -> Result<(), Error> {
        self.with_state(Primitive::Migrate, |state, id| {
            let record = state.record_mut(id)?;
            record.server_id = Some(match host {
                Some(host) => format!("server-{id}@{host}"),
                None => format!("server-{id}"),
            });
            Ok(())
        })
    }

    async fn delete_async(&self) -> Result<(), Error> {
        self.with_state(Primitive::DeleteAsync, |state, id| {
            state.instances.remove(id);
            state.guests.remove(id);
            Ok(())
        })
    }

    async fn create_backup(&self, info: &BackupInfo) -> Result<(), Error> {
        self.with_state(Primitive::CreateBackup, |state, id| {
            if let Some(parent) = &info.parent_id {
                if !state.backups.contains_key(parent) {
                    return Err(guest_error(
                        id,
                        Primitive::CreateBackup,
                        format!("parent backup {parent} does not exist"),
                    ));
                }
            }
            state.backups.insert(info.id.clone(), info.clone());
            Ok(())
        })
    }

    async fn update_overrides(&self, overrides: &Value) -> Result<(), Error> {
        self.with_state(Primitive::UpdateOverrides, |state, id| {
            state.guest_mut(id).overrides = Some(overrides.clone());
            Ok(())
        })
    }

    async fn unassign_configuration(
        &self,
        flavor: &Flavor,
        configuration_id: &str,
    ) -> Result<(), Error> {
        self.with_state(Primitive::UnassignConfiguration, |state, id| {
            let record = state.record_mut(id)?;
            if record.configuration_id.as_deref() != Some(configuration_id) {
                return Err(guest_error(
                    id,
                    Primitive::UnassignConfiguration,
                    format!("configuration {configuration_id} is not assigned"),
                ));
            }
            record.configuration_id = None;
            record.flavor_id = Some(flavor.id.clone());
            state.guest_mut(id).overrides = None;
            Ok(())
        })
    }

    async fn make_read_only(&self, read_only: bool) -> Result<(), Error> {
        self.with_state(Primitive::MakeReadOnly, |state, id| {
            state.guest_mut(id).read_only = read_only;
            Ok(())
        })
    }

    async fn detach_public_ips(&self) -> Result<Vec<String>, Error> {
        self.with_state(Primitive::DetachPublicIps, |state, id| {
            Ok(std::mem::take(&mut state.record_mut(id)?.public_ips))
        })
    }

    async fn attach_public_ips(&self, ips: &[String]) -> Result<(), Error> {
        self.with_state(Primitive::AttachPublicIps, |state, id| {
            for ip in ips {
                if let Some(owner) = state.endpoint_owner(ip) {
                    if owner != id {
                        return Err(guest_error(
                            id,
                            Primitive::AttachPublicIps,
                            format!("endpoint {ip} is attached to {owner}"),
                        ));
                    }
                }
            }
            let record = state.record_mut(id)?;
            for ip in ips {
                if !record.public_ips.contains(ip) {
                    record.public_ips.push(ip.clone());
                }
            }
            Ok(())
        })
    }

    async fn get_latest_txn_id(&self) -> Result<TxnId, Error> {
        self.with_state(Primitive::GetLatestTxnId, |state, id| {
            Ok(TxnId(state.guest_mut(id).txn_count.to_string()))
        })
    }

    async fn get_txn_count(&self) -> Result<u64, Error> {
        self.with_state(Primitive::GetTxnCount, |state, id| {
            Ok(state.guest_mut(id).txn_count)
        })
    }

    async fn wait_for_txn(&self, txn: &TxnId) -> Result<(), Error> {
        let stalled = self.with_state(Primitive::WaitForTxn, |state, id| {
            let target: u64 = txn.as_str().parse().map_err(|_| {
                guest_error(id, Primitive::WaitForTxn, format!("malformed transaction id {txn}"))
            })?;
            if state.stalled.contains(id) {
                return Ok(true);
            }
            let guest = state.guest_mut(id);
            guest.txn_count = guest.txn_count.max(target);
            Ok(false)
        })?;
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn detach_replica(&self, source: &dyn BuiltInstanceTasks) -> Result<(), Error> {
        self.with_state(Primitive::DetachReplica, |state, id| {
            let record = state.record_mut(id)?;
            if record.slave_of_id.as_ref() != Some(source.id()) {
                return Err(guest_error(
                    id,
                    Primitive::DetachReplica,
                    format!("not replicating from {}", source.id()),
                ));
            }
            record.slave_of_id = None;
            record.role = ReplicationRole::None;
            Ok(())
        })
    }

    async fn attach_replica(&self, source: &dyn BuiltInstanceTasks) -> Result<(), Error> {
        self.with_state(Primitive::AttachReplica, |state, id| {
            let source_is_master = state
                .instances
                .get(source.id())
                .is_some_and(|r| r.role == ReplicationRole::Master && r.slave_of_id.is_none());
            if !source_is_master {
                return Err(guest_error(
                    id,
                    Primitive::AttachReplica,
                    format!("{} is not a replication source", source.id()),
                ));
            }
            let record = state.record_mut(id)?;
            record.slave_of_id = Some(source.id().clone());
            record.role = ReplicationRole::Slave;
            state.guest_mut(id).read_only = true;
            Ok(())
        })
    }

    async fn enable_as_master(&self) -> Result<(), Error> {
        self.with_state(Primitive::EnableAsMaster, |state, id| {
            let record = state.record_mut(id)?;
            if let Some(source) = &record.slave_of_id {
                return Err(guest_error(
                    id,
                    Primitive::EnableAsMaster,
                    format!("still replicating from {source}"),
                ));
            }
            record.role = ReplicationRole::Master;
            state.guest_mut(id).master_enabled = true;
            Ok(())
        })
    }

    async fn demote_replication_master(&self) -> Result<(), Error> {
        self.with_state(Primitive::DemoteReplicationMaster, |state, id| {
            let record = state.record_mut(id)?;
            if record.role == ReplicationRole::Master {
                record.role = ReplicationRole::None;
            }
            state.guest_mut(id).master_enabled = false;
            Ok(())
        })
    }
}

#[async_trait]
impl FreshInstanceTasks for MemoryInstanceTasks {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        backup_id: Option<&BackupId>,
        _cluster_config: Option<&Value>,
    ) -> Result<(), Error> {
        self.with_state(Primitive::CreateInstance, |state, id| {
            let restore_from = backup_id.or(request.backup_id.as_ref());
            if let Some(backup) = restore_from {
                if !state.backups.contains_key(backup) {
                    return Err(guest_error(
                        id,
                        Primitive::CreateInstance,
                        format!("backup {backup} does not exist"),
                    ));
                }
            }
            let record = state.record_mut(id)?;
            record.name = request.name.clone();
            record.datastore_manager = request.datastore_manager.clone();
            record.flavor_id = Some(request.flavor.id.clone());
            record.volume_size = request.volume_size;
            record.volume_id = request.volume_size.map(|_| format!("volume-{id}"));
            record.server_id = Some(format!("server-{id}"));
            state.guest_mut(id).overrides = request.overrides.clone();
            Ok(())
        })
    }

    async fn get_replication_master_snapshot(
        &self,
        _ctx: &Context,
        source_id: &InstanceId,
        backup_id: Option<&BackupId>,
    ) -> Result<ReplicationSnapshot, Error> {
        self.with_state(Primitive::GetReplicationMasterSnapshot, |state, id| {
            let provisioned = state
                .instances
                .get(source_id)
                .is_some_and(|r| r.is_provisioned());
            if !provisioned {
                return Err(guest_error(
                    id,
                    Primitive::GetReplicationMasterSnapshot,
                    format!("source {source_id} is not available"),
                ));
            }
            state.next_snapshot += 1;
            let snapshot_id = BackupId(format!("snapshot-{}", state.next_snapshot));
            let txn_count = state.guest_mut(source_id).txn_count;
            state.backups.insert(
                snapshot_id.clone(),
                BackupInfo {
                    id: snapshot_id.clone(),
                    name: format!("replication snapshot of {source_id}"),
                    description: None,
                    parent_id: backup_id.cloned(),
                },
            );
            Ok(ReplicationSnapshot {
                snapshot_id,
                source_id: source_id.clone(),
                log_position: json!({ "txn_count": txn_count }),
            })
        })
    }

    async fn attach_replication_slave(
        &self,
        snapshot: &ReplicationSnapshot,
        _flavor: &Flavor,
    ) -> Result<(), Error> {
        self.with_state(Primitive::AttachReplicationSlave, |state, id| {
            let record = state.record_mut(id)?;
            record.slave_of_id = Some(snapshot.source_id.clone());
            record.role = ReplicationRole::Slave;
            let guest = state.guest_mut(id);
            guest.read_only = true;
            guest.txn_count = snapshot.log_position["txn_count"].as_u64().unwrap_or(0);
            Ok(())
        })
    }

    async fn delete_async(&self) -> Result<(), Error> {
        BuiltInstanceTasks::delete_async(self).await
    }
}
