// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task orchestration for managed database instances.
//!
//! The task manager drives long-running, multi-step operations against
//! running database instances: provisioning, resizing, migration, deletion,
//! backups and, most delicately, replication topology changes. Every call is
//! bound to a target instance or cluster whose durable state is reloaded at
//! the start of the call; the task manager never caches instance state across
//! calls.
//!
//! The work itself happens behind capability traits (see [`instance`]): the
//! task manager sequences calls against an [`instance::BuiltInstanceTasks`]
//! handle and records the outcome in each instance's
//! [`status::TaskStatus`]. Replication topology changes are sequenced by the
//! [`topology::TopologyController`], and datastore-specific operations are
//! resolved by name through a [`strategy::StrategyRegistry`].
//!
//! [`memory::MemoryFleet`] is a complete in-process implementation of the
//! capabilities, used by the tests and by `dbaas-taskmanagerd`.

pub mod config;
pub mod context;
pub mod error;
pub mod instance;
pub mod manager;
pub mod memory;
pub mod periodic;
pub mod status;
pub mod strategy;
pub mod topology;

pub use crate::config::TaskManagerConfig;
pub use crate::context::Context;
pub use crate::error::{Error, Result};
pub use crate::manager::TaskManager;
