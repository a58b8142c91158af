// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task manager errors.

use std::time::Duration;

use itertools::Itertools;

use crate::instance::{BackupId, ClusterId, InstanceId, Primitive, TxnId};
use crate::status::TaskStatus;
use crate::topology::TopologyOperation;

/// The result type used throughout the task manager.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error produced by an orchestrated operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),
    #[error("cluster {0} not found")]
    ClusterNotFound(ClusterId),
    /// The instance exists but is not in a state the requested handle can
    /// work with, typically because provisioning never finished.
    #[error("instance {id} cannot be processed: {reason}")]
    Unprocessable { id: InstanceId, reason: String },
    /// A primitive failed on the instance's remote execution surface.
    #[error("{primitive} failed on instance {id}: {message}")]
    Guest {
        id: InstanceId,
        primitive: Primitive,
        message: String,
    },
    #[error("instance {id} did not apply transaction {txn} within {}s", .timeout.as_secs())]
    TxnWaitTimeout {
        id: InstanceId,
        txn: TxnId,
        timeout: Duration,
    },
    #[error("operation on instance {0} was cancelled")]
    Cancelled(InstanceId),
    #[error("instance {id} cannot move from task status {from} to {to}")]
    InvalidTransition {
        id: InstanceId,
        from: TaskStatus,
        to: TaskStatus,
    },
    /// A topology change established the new source but could not move every
    /// participant over. The listed instances need manual reconciliation.
    #[error(
        "{operation} finished with instances that may not have been switched to the new source: {}",
        .instances.iter().join(", ")
    )]
    ReplicaAttach {
        operation: TopologyOperation,
        instances: Vec<InstanceId>,
    },
    #[error("no replica of {0} can become the replication source")]
    NoEjectionCandidate(InstanceId),
    #[error("cannot derive a manager from operation name {0:?}")]
    MissingManagerPrefix(String),
    #[error("no task manager strategy for manager {0:?}")]
    NoStrategy(String),
    #[error("no method {method:?} in the task manager strategy for manager {manager:?}")]
    NoSuchMethod { manager: String, method: String },
    #[error("the task manager strategy for manager {0:?} has no cluster tasks")]
    NoClusterTasks(String),
    #[error("invalid arguments for {operation}: {source}")]
    InvalidArguments {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backup {id}: {message}")]
    Backup { id: BackupId, message: String },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Reports whether the target exists but was loaded through the wrong
    /// kind of handle.
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, Error::Unprocessable { .. })
    }

    /// Reports whether the operation completed its critical section and only
    /// failed to reconcile some participants.
    pub fn is_partial_success(&self) -> bool {
        matches!(self, Error::ReplicaAttach { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::InstanceNotFound(_) | Error::ClusterNotFound(_)
        )
    }

    /// Reports whether the error came from resolving a datastore strategy.
    pub fn is_strategy_resolution(&self) -> bool {
        matches!(
            self,
            Error::MissingManagerPrefix(_) | Error::NoStrategy(_) | Error::NoSuchMethod { .. }
        )
    }
}
