// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task manager configuration.

use std::time::Duration;

use derivative::Derivative;

/// Credentials of the task manager's own administrative identity.
#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct AdminCredentials {
    pub user: String,
    #[derivative(Debug = "ignore")]
    pub password: String,
    pub tenant_id: String,
}

/// Configures a [`crate::TaskManager`].
///
/// Built once at process start and read-only afterwards.
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Identity used for work the task manager starts on its own.
    pub admin: AdminCredentials,
    pub topology: TopologyConfig,
    pub periodic: PeriodicConfig,
}

impl TaskManagerConfig {
    /// Returns a configuration with default tuning for the given admin
    /// identity.
    pub fn new(admin: AdminCredentials) -> TaskManagerConfig {
        TaskManagerConfig {
            admin,
            topology: TopologyConfig::default(),
            periodic: PeriodicConfig::default(),
        }
    }
}

/// Tuning for replication topology changes.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Upper bound on each wait for a replica to apply a transaction.
    pub txn_wait_timeout: Duration,
    /// How many replicas are moved to a new source at once.
    pub replica_migration_concurrency: usize,
}

impl Default for TopologyConfig {
    fn default() -> TopologyConfig {
        TopologyConfig {
            txn_wait_timeout: Duration::from_secs(5 * 60),
            replica_migration_concurrency: 1,
        }
    }
}

/// Configures the periodic maintenance hook.
#[derive(Debug, Clone)]
pub struct PeriodicConfig {
    /// Length of one tick.
    pub tick_interval: Duration,
    /// Number of ticks skipped between two exists-event publications. The
    /// hook is disabled when unset.
    pub exists_notification_ticks: Option<u32>,
}

impl Default for PeriodicConfig {
    fn default() -> PeriodicConfig {
        PeriodicConfig {
            tick_interval: Duration::from_secs(60),
            exists_notification_ticks: None,
        }
    }
}

/// Command-line and environment surface of [`TaskManagerConfig`].
#[derive(clap::Parser, Derivative, Clone)]
#[derivative(Debug)]
pub struct TaskManagerArgs {
    /// User name of the administrative identity.
    #[clap(long, env = "TASKMANAGER_ADMIN_USER")]
    admin_user: String,
    /// Password of the administrative identity.
    #[derivative(Debug = "ignore")]
    #[clap(long, env = "TASKMANAGER_ADMIN_PASSWORD", hide_env_values = true)]
    admin_password: String,
    /// Tenant of the administrative identity.
    #[clap(long, env = "TASKMANAGER_ADMIN_TENANT_ID")]
    admin_tenant_id: String,
    /// How long a replication topology change waits for a replica to catch
    /// up to the old source before giving up on it.
    #[clap(
        long,
        env = "TASKMANAGER_TXN_WAIT_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "5m"
    )]
    txn_wait_timeout: Duration,
    /// How many replicas are moved to a new replication source at once.
    #[clap(
        long,
        env = "TASKMANAGER_REPLICA_MIGRATION_CONCURRENCY",
        default_value = "1",
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    replica_migration_concurrency: u16,
    /// Length of one periodic task tick.
    #[clap(
        long,
        env = "TASKMANAGER_PERIODIC_TICK_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "60s"
    )]
    periodic_tick_interval: Duration,
    /// Ticks skipped between exists notifications. Unset disables them.
    #[clap(long, env = "TASKMANAGER_EXISTS_NOTIFICATION_TICKS")]
    exists_notification_ticks: Option<u32>,
}

impl From<TaskManagerArgs> for TaskManagerConfig {
    fn from(args: TaskManagerArgs) -> TaskManagerConfig {
        TaskManagerConfig {
            admin: AdminCredentials {
                user: args.admin_user,
                password: args.admin_password,
                tenant_id: args.admin_tenant_id,
            },
            topology: TopologyConfig {
                txn_wait_timeout: args.txn_wait_timeout,
                replica_migration_concurrency: usize::from(args.replica_migration_concurrency),
            },
            periodic: PeriodicConfig {
                tick_interval: args.periodic_tick_interval,
                exists_notification_ticks: args.exists_notification_ticks,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    const ADMIN: [&str; 7] = [
        "taskmanagerd",
        "--admin-user",
        "admin",
        "--admin-password",
        "hunter2",
        "--admin-tenant-id",
        "service",
    ];

    #[test]
    fn defaults() {
        let args = TaskManagerArgs::try_parse_from(ADMIN).unwrap();
        assert!(!format!("{args:?}").contains("hunter2"));
        let config = TaskManagerConfig::from(args);
        assert_eq!(config.admin.user, "admin");
        assert_eq!(config.admin.tenant_id, "service");
        assert_eq!(config.topology.txn_wait_timeout, Duration::from_secs(300));
        assert_eq!(config.topology.replica_migration_concurrency, 1);
        assert_eq!(config.periodic.tick_interval, Duration::from_secs(60));
        assert_eq!(config.periodic.exists_notification_ticks, None);
    }

    #[test]
    fn overrides() {
        let args = TaskManagerArgs::try_parse_from(ADMIN.into_iter().chain([
            "--txn-wait-timeout",
            "90s",
            "--replica-migration-concurrency",
            "4",
            "--periodic-tick-interval",
            "1m 30s",
            "--exists-notification-ticks",
            "10",
        ]))
        .unwrap();
        let config = TaskManagerConfig::from(args);
        assert_eq!(config.topology.txn_wait_timeout, Duration::from_secs(90));
        assert_eq!(config.topology.replica_migration_concurrency, 4);
        assert_eq!(config.periodic.tick_interval, Duration::from_secs(90));
        assert_eq!(config.periodic.exists_notification_ticks, Some(10));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let result = TaskManagerArgs::try_parse_from(
            ADMIN
                .into_iter()
                .chain(["--replica-migration-concurrency", "0"]),
        );
        assert!(result.is_err());
    }
}
