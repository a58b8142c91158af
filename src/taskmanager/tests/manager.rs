// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Instance, cluster and strategy operations against an in-process fleet.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dbaas_taskmanager::config::AdminCredentials;
use dbaas_taskmanager::instance::{
    BackupId, BackupInfo, ClusterId, ClusterRecord, ClusterTasks, CreateInstanceRequest, Flavor,
    InstanceId, InstanceRecord, Primitive, ReplicationRole,
};
use dbaas_taskmanager::memory::{GuestState, MemoryFleet};
use dbaas_taskmanager::status::TaskStatus;
use dbaas_taskmanager::strategy::{StrategyAction, StrategyRegistry, TaskManagerStrategy};
use dbaas_taskmanager::{Context, Error, TaskManager, TaskManagerConfig};
use serde_json::{Value, json};

fn config() -> TaskManagerConfig {
    TaskManagerConfig::new(AdminCredentials {
        user: "admin".into(),
        password: "secret".into(),
        tenant_id: "service".into(),
    })
}

fn manager_with(
    fleet: &MemoryFleet,
    config: TaskManagerConfig,
    strategies: StrategyRegistry,
) -> TaskManager {
    TaskManager::new(
        config,
        Arc::new(fleet.clone()),
        Arc::new(fleet.clone()),
        Arc::new(strategies),
    )
}

fn manager(fleet: &MemoryFleet) -> TaskManager {
    manager_with(fleet, config(), StrategyRegistry::new())
}

fn ctx() -> Context {
    Context::new("alice", "tenant")
}

fn id(s: &str) -> InstanceId {
    InstanceId::from(s)
}

fn small() -> Flavor {
    Flavor {
        id: "small".into(),
        ram_mb: 2048,
        vcpus: 1,
    }
}

fn large() -> Flavor {
    Flavor {
        id: "large".into(),
        ram_mb: 8192,
        vcpus: 4,
    }
}

fn create_request(slave_of_id: Option<&str>) -> CreateInstanceRequest {
    CreateInstanceRequest {
        name: "new".into(),
        flavor: small(),
        image_id: "mysql-8".into(),
        databases: vec![],
        users: vec![],
        datastore_manager: "mysql".into(),
        packages: vec![],
        volume_size: Some(10),
        backup_id: None,
        availability_zone: None,
        root_password: None,
        nics: vec![],
        overrides: None,
        slave_of_id: slave_of_id.map(InstanceId::from),
        cluster_config: None,
    }
}

/// A fleet with the replica set `s` -> `r1` and an unprovisioned `new`.
fn fleet() -> MemoryFleet {
    let fleet = MemoryFleet::replica_set("s", &["r1"]);
    fleet.insert(InstanceRecord::new("new"), GuestState::default());
    fleet
}

#[tokio::test]
async fn resize_volume_clears_status() {
    let fleet = fleet();
    manager(&fleet)
        .resize_volume(&ctx(), &id("s"), 20)
        .await
        .unwrap();
    let record = fleet.instance("s").unwrap();
    assert_eq!(record.volume_size, Some(20));
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(
        fleet.calls_to("s"),
        vec![
            Primitive::SetTaskStatus,
            Primitive::ResizeVolume,
            Primitive::SetTaskStatus
        ]
    );
}

#[tokio::test]
async fn failed_task_still_clears_status() {
    let fleet = fleet();
    fleet.fail("s", Primitive::Reboot);
    let err = manager(&fleet).reboot(&ctx(), &id("s")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Guest {
            primitive: Primitive::Reboot,
            ..
        }
    ));
    assert_eq!(fleet.task_status("s"), Some(TaskStatus::None));
}

#[tokio::test]
async fn busy_instances_are_refused() {
    let fleet = fleet();
    fleet.set_task_status("s", TaskStatus::Rebooting);
    let err = manager(&fleet)
        .resize_volume(&ctx(), &id("s"), 20)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert!(!fleet.calls_to("s").contains(&Primitive::ResizeVolume));
    assert_eq!(fleet.task_status("s"), Some(TaskStatus::Rebooting));
}

#[tokio::test]
async fn unprovisioned_instances_are_unprocessable() {
    let fleet = fleet();
    let err = manager(&fleet).restart(&ctx(), &id("new")).await.unwrap_err();
    assert!(err.is_unprocessable());
    let err = manager(&fleet).restart(&ctx(), &id("nope")).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn instance_maintenance() {
    let fleet = fleet();
    let manager = manager(&fleet);
    let ctx = ctx();

    manager
        .resize_flavor(&ctx, &id("s"), &small(), &large())
        .await
        .unwrap();
    assert_eq!(fleet.instance("s").unwrap().flavor_id.as_deref(), Some("large"));

    manager.restart(&ctx, &id("s")).await.unwrap();
    manager.migrate(&ctx, &id("s"), Some("host-7")).await.unwrap();
    assert_eq!(
        fleet.instance("s").unwrap().server_id.as_deref(),
        Some("server-s@host-7")
    );

    manager
        .update_overrides(&ctx, &id("s"), &json!({"max_connections": 500}))
        .await
        .unwrap();
    assert_eq!(
        fleet.guest("s").unwrap().overrides,
        Some(json!({"max_connections": 500}))
    );

    let mut record = fleet.instance("r1").unwrap();
    record.configuration_id = Some("cfg-1".into());
    fleet.insert(record, fleet.guest("r1").unwrap());
    manager
        .unassign_configuration(&ctx, &id("r1"), &large(), "cfg-1")
        .await
        .unwrap();
    let record = fleet.instance("r1").unwrap();
    assert_eq!(record.configuration_id, None);
    assert_eq!(record.flavor_id.as_deref(), Some("large"));

    for instance in ["s", "r1"] {
        assert_eq!(fleet.task_status(instance), Some(TaskStatus::None));
    }
}

#[tokio::test]
async fn backups() {
    let fleet = fleet();
    let manager = manager(&fleet);
    let info = BackupInfo {
        id: BackupId::from("b1"),
        name: "nightly".into(),
        description: None,
        parent_id: None,
    };
    manager.create_backup(&ctx(), &info, &id("s")).await.unwrap();
    assert_eq!(fleet.backup("b1"), Some(info));
    assert_eq!(fleet.task_status("s"), Some(TaskStatus::None));

    manager
        .delete_backup(&ctx(), &BackupId::from("b1"))
        .await
        .unwrap();
    assert_eq!(fleet.backup("b1"), None);
    assert_eq!(fleet.deleted_backups(), vec![BackupId::from("b1")]);

    let err = manager
        .delete_backup(&ctx(), &BackupId::from("b1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backup { .. }));
}

#[tokio::test]
async fn detach_replica() {
    let fleet = fleet();
    let manager = manager(&fleet);
    manager.detach_replica(&ctx(), &id("r1")).await.unwrap();
    let record = fleet.instance("r1").unwrap();
    assert_eq!(record.slave_of_id, None);
    assert_eq!(record.role, ReplicationRole::None);
    assert!(fleet.instance("s").unwrap().replicas.is_empty());

    let err = manager.detach_replica(&ctx(), &id("s")).await.unwrap_err();
    assert!(err.is_unprocessable());
}

#[tokio::test]
async fn delete_provisioned_instance() {
    let fleet = fleet();
    manager(&fleet)
        .delete_instance(&ctx(), &id("r1"))
        .await
        .unwrap();
    assert_eq!(fleet.instance("r1"), None);
}

#[tokio::test]
async fn delete_falls_back_for_unfinished_instances() {
    let fleet = fleet();
    manager(&fleet)
        .delete_instance(&ctx(), &id("new"))
        .await
        .unwrap();
    assert_eq!(fleet.instance("new"), None);
    assert_eq!(
        fleet.calls_to("new"),
        vec![Primitive::SetTaskStatus, Primitive::DeleteAsync]
    );
}

#[tokio::test]
async fn delete_is_allowed_from_error_states() {
    let fleet = fleet();
    fleet.set_task_status("r1", TaskStatus::PromotionError);
    manager(&fleet)
        .delete_instance(&ctx(), &id("r1"))
        .await
        .unwrap();
    assert_eq!(fleet.instance("r1"), None);
}

#[tokio::test]
async fn failed_delete_keeps_the_error_state() {
    let fleet = fleet();
    fleet.set_task_status("r1", TaskStatus::PromotionError);
    fleet.fail("r1", Primitive::DeleteAsync);

    let err = manager(&fleet)
        .delete_instance(&ctx(), &id("r1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Guest {
            primitive: Primitive::DeleteAsync,
            ..
        }
    ));
    assert_eq!(fleet.task_status("r1"), Some(TaskStatus::PromotionError));

    // Without a prior error the marker is simply cleared.
    fleet.fail("s", Primitive::DeleteAsync);
    let result = manager(&fleet).delete_instance(&ctx(), &id("s")).await;
    assert!(result.is_err());
    assert_eq!(fleet.task_status("s"), Some(TaskStatus::None));
}

#[tokio::test]
async fn delete_missing_instance() {
    let fleet = fleet();
    let err = manager(&fleet)
        .delete_instance(&ctx(), &id("nope"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn create_standalone_instance() {
    let fleet = fleet();
    manager(&fleet)
        .create_instance(&ctx(), &id("new"), &create_request(None))
        .await
        .unwrap();
    let record = fleet.instance("new").unwrap();
    assert!(record.is_provisioned());
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(record.slave_of_id, None);
    assert!(
        !fleet
            .calls_to("new")
            .contains(&Primitive::GetReplicationMasterSnapshot)
    );
}

#[tokio::test]
async fn create_replica_from_snapshot() {
    let fleet = fleet();
    fleet.set_txn_count("s", 42);
    manager(&fleet)
        .create_instance(&ctx(), &id("new"), &create_request(Some("s")))
        .await
        .unwrap();

    let record = fleet.instance("new").unwrap();
    assert_eq!(record.task_status, TaskStatus::None);
    assert_eq!(record.slave_of_id, Some(id("s")));
    assert_eq!(record.role, ReplicationRole::Slave);
    assert_eq!(fleet.guest("new").unwrap().txn_count, 42);
    assert!(fleet.instance("s").unwrap().replicas.contains(&id("new")));

    let snapshot = BackupId::from("snapshot-1");
    assert_eq!(fleet.deleted_backups(), vec![snapshot.clone()]);
    assert_eq!(fleet.backup(snapshot), None);
    assert_eq!(
        fleet.calls_to("new"),
        vec![
            Primitive::SetTaskStatus,
            Primitive::GetReplicationMasterSnapshot,
            Primitive::CreateInstance,
            Primitive::AttachReplicationSlave,
            Primitive::SetTaskStatus,
        ]
    );
}

#[tokio::test]
async fn snapshot_is_deleted_when_provisioning_fails() {
    let fleet = fleet();
    fleet.fail("new", Primitive::CreateInstance);
    let err = manager(&fleet)
        .create_instance(&ctx(), &id("new"), &create_request(Some("s")))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Guest {
            primitive: Primitive::CreateInstance,
            ..
        }
    ));
    assert_eq!(fleet.deleted_backups(), vec![BackupId::from("snapshot-1")]);
    assert_eq!(fleet.task_status("new"), Some(TaskStatus::BuildingError));
    assert!(
        !fleet
            .calls_to("new")
            .contains(&Primitive::AttachReplicationSlave)
    );
}

#[tokio::test]
async fn failed_snapshot_deletion_stops_the_bootstrap() {
    let fleet = fleet();
    fleet.fail_backup_deletes(true);
    let err = manager(&fleet)
        .create_instance(&ctx(), &id("new"), &create_request(Some("s")))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Backup { .. }));
    assert!(fleet.backup("snapshot-1").is_some());
    assert_eq!(fleet.task_status("new"), Some(TaskStatus::BuildingError));
    assert!(
        !fleet
            .calls_to("new")
            .contains(&Primitive::AttachReplicationSlave)
    );
}

#[tokio::test]
async fn provisioning_error_wins_over_snapshot_deletion_error() {
    let fleet = fleet();
    fleet.fail("new", Primitive::CreateInstance);
    fleet.fail_backup_deletes(true);
    let err = manager(&fleet)
        .create_instance(&ctx(), &id("new"), &create_request(Some("s")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Guest {
            primitive: Primitive::CreateInstance,
            ..
        }
    ));
}

#[derive(Debug, Default)]
struct RecordingClusterTasks {
    calls: Mutex<Vec<(&'static str, ClusterId)>>,
}

#[async_trait]
impl ClusterTasks for RecordingClusterTasks {
    async fn create_cluster(&self, _ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error> {
        self.calls
            .lock()
            .unwrap()
            .push(("create", cluster_id.clone()));
        Ok(())
    }

    async fn delete_cluster(&self, _ctx: &Context, cluster_id: &ClusterId) -> Result<(), Error> {
        self.calls
            .lock()
            .unwrap()
            .push(("delete", cluster_id.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingAction {
    calls: Mutex<Vec<Value>>,
}

#[async_trait]
impl StrategyAction for RecordingAction {
    async fn call(&self, _ctx: &Context, args: Value) -> Result<(), Error> {
        self.calls.lock().unwrap().push(args);
        Ok(())
    }
}

fn cluster(id: &str, manager: &str) -> ClusterRecord {
    ClusterRecord {
        id: ClusterId::from(id),
        name: id.into(),
        datastore_manager: manager.into(),
        instances: vec![],
    }
}

#[tokio::test]
async fn cluster_tasks_come_from_the_strategy() {
    let fleet = fleet();
    fleet.add_cluster(cluster("mongo-1", "mongodb"));
    fleet.add_cluster(cluster("mysql-1", "mysql"));
    fleet.add_cluster(cluster("redis-1", "redis"));

    let tasks = Arc::new(RecordingClusterTasks::default());
    let mut strategies = StrategyRegistry::new();
    let cluster_tasks: Arc<dyn ClusterTasks> = Arc::clone(&tasks) as _;
    strategies.register(TaskManagerStrategy::new("mongodb").with_cluster_tasks(cluster_tasks));
    strategies.register(TaskManagerStrategy::new("mysql"));
    let manager = manager_with(&fleet, config(), strategies);

    manager
        .create_cluster(&ctx(), &ClusterId::from("mongo-1"))
        .await
        .unwrap();
    manager
        .delete_cluster(&ctx(), &ClusterId::from("mongo-1"))
        .await
        .unwrap();
    assert_eq!(
        *tasks.calls.lock().unwrap(),
        vec![
            ("create", ClusterId::from("mongo-1")),
            ("delete", ClusterId::from("mongo-1")),
        ]
    );

    let err = manager
        .create_cluster(&ctx(), &ClusterId::from("mysql-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoClusterTasks(ref m) if m == "mysql"));
    let err = manager
        .create_cluster(&ctx(), &ClusterId::from("redis-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoStrategy(ref m) if m == "redis"));
    let err = manager
        .delete_cluster(&ctx(), &ClusterId::from("nope"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn dispatch_by_name() {
    let fleet = fleet();
    let grow = Arc::new(RecordingAction::default());
    let mut strategies = StrategyRegistry::new();
    let action: Arc<dyn StrategyAction> = Arc::clone(&grow) as _;
    strategies.register(TaskManagerStrategy::new("mysql").with_action("grow", action));
    let manager = manager_with(&fleet, config(), strategies);
    let ctx = ctx();

    manager
        .dispatch(&ctx, "resize_volume", json!({"instance_id": "s", "new_size": 30}))
        .await
        .unwrap();
    assert_eq!(fleet.instance("s").unwrap().volume_size, Some(30));

    manager
        .dispatch(&ctx, "mysql_grow", json!({"members": 2}))
        .await
        .unwrap();
    assert_eq!(*grow.calls.lock().unwrap(), vec![json!({"members": 2})]);

    let err = manager
        .dispatch(&ctx, "reboot", json!({"instance": "s"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArguments { ref operation, .. } if operation == "reboot"));

    let err = manager.dispatch(&ctx, "foo_bar", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::NoStrategy(ref m) if m == "foo"));
    let err = manager
        .dispatch(&ctx, "mysql_shrink", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoSuchMethod { ref method, .. } if method == "shrink"));
    let err = manager.dispatch(&ctx, "_grow", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::MissingManagerPrefix(_)));
}

#[tokio::test]
async fn dispatch_create_instance() {
    let fleet = fleet();
    let mut args = serde_json::to_value(create_request(Some("s"))).unwrap();
    args["instance_id"] = json!("new");
    manager(&fleet)
        .dispatch(&ctx(), "create_instance", args)
        .await
        .unwrap();
    assert_eq!(fleet.instance("new").unwrap().slave_of_id, Some(id("s")));
}

#[tokio::test(start_paused = true)]
async fn periodic_exists_events() {
    let fleet = fleet();
    let mut enabled = config();
    enabled.periodic.tick_interval = Duration::from_secs(10);
    enabled.periodic.exists_notification_ticks = Some(1);
    let manager = manager_with(&fleet, enabled, StrategyRegistry::new())
        .with_exists_publisher(Arc::new(fleet.clone()));

    let periodic = manager.spawn_periodic_tasks().unwrap();
    tokio::time::sleep(Duration::from_secs(25)).await;
    periodic.shutdown().await;

    // Two provisioned instances, published at t=0 and t=20.
    assert_eq!(fleet.exists_events().len(), 4);

    let disabled = manager_with(&fleet, config(), StrategyRegistry::new())
        .with_exists_publisher(Arc::new(fleet.clone()));
    assert!(disabled.spawn_periodic_tasks().is_none());
}
