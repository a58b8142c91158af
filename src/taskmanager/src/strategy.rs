// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Datastore-specific task manager strategies.
//!
//! The task manager's built-in operations are a fixed set. Datastores add
//! their own orchestrated operations through a [`TaskManagerStrategy`]
//! registered under the datastore manager's name. An operation named
//! `<manager>_<method>` resolves to the action `method` of the strategy
//! registered for `manager`; the name is split at the first underscore, so
//! the method part may itself contain underscores.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::error::Error;
use crate::instance::ClusterTasks;

/// A named operation supplied by a datastore strategy.
#[async_trait]
pub trait StrategyAction: fmt::Debug + Send + Sync {
    async fn call(&self, ctx: &Context, args: Value) -> Result<(), Error>;
}

/// The operations one datastore manager adds to the task manager.
#[derive(Debug, Clone)]
pub struct TaskManagerStrategy {
    manager: String,
    actions: BTreeMap<String, Arc<dyn StrategyAction>>,
    cluster_tasks: Option<Arc<dyn ClusterTasks>>,
}

impl TaskManagerStrategy {
    pub fn new(manager: impl Into<String>) -> TaskManagerStrategy {
        TaskManagerStrategy {
            manager: manager.into(),
            actions: BTreeMap::new(),
            cluster_tasks: None,
        }
    }

    /// Adds an action, replacing any action with the same name.
    pub fn with_action(
        mut self,
        method: impl Into<String>,
        action: Arc<dyn StrategyAction>,
    ) -> TaskManagerStrategy {
        self.actions.insert(method.into(), action);
        self
    }

    pub fn with_cluster_tasks(mut self, cluster_tasks: Arc<dyn ClusterTasks>) -> TaskManagerStrategy {
        self.cluster_tasks = Some(cluster_tasks);
        self
    }

    pub fn manager(&self) -> &str {
        &self.manager
    }

    pub fn action(&self, method: &str) -> Option<&Arc<dyn StrategyAction>> {
        self.actions.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(|m| m.as_str())
    }

    pub fn cluster_tasks(&self) -> Option<&Arc<dyn ClusterTasks>> {
        self.cluster_tasks.as_ref()
    }
}

/// Looks up the strategy of a datastore manager.
pub trait StrategyProvider: fmt::Debug + Send + Sync {
    fn load_strategy(&self, manager: &str) -> Option<Arc<TaskManagerStrategy>>;
}

/// A [`StrategyProvider`] holding strategies registered in process.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<TaskManagerStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> StrategyRegistry {
        StrategyRegistry::default()
    }

    /// Registers `strategy` under its manager name, returning the strategy it
    /// replaces.
    pub fn register(&mut self, strategy: TaskManagerStrategy) -> Option<Arc<TaskManagerStrategy>> {
        self.strategies
            .insert(strategy.manager.clone(), Arc::new(strategy))
    }

    pub fn managers(&self) -> impl Iterator<Item = &str> {
        self.strategies.keys().map(|m| m.as_str())
    }
}

impl StrategyProvider for StrategyRegistry {
    fn load_strategy(&self, manager: &str) -> Option<Arc<TaskManagerStrategy>> {
        self.strategies.get(manager).cloned()
    }
}

/// An operation name resolved to a strategy action.
#[derive(Debug, Clone)]
pub struct ResolvedAction {
    pub manager: String,
    pub method: String,
    pub action: Arc<dyn StrategyAction>,
}

/// Resolves the operation `name` against the strategies of `provider`.
pub fn resolve(provider: &dyn StrategyProvider, name: &str) -> Result<ResolvedAction, Error> {
    let (manager, method) = name.split_once('_').unwrap_or((name, ""));
    if manager.is_empty() {
        return Err(Error::MissingManagerPrefix(name.into()));
    }
    let strategy = provider
        .load_strategy(manager)
        .ok_or_else(|| Error::NoStrategy(manager.into()))?;
    let action = strategy
        .action(method)
        .ok_or_else(|| Error::NoSuchMethod {
            manager: manager.into(),
            method: method.into(),
        })?;
    Ok(ResolvedAction {
        manager: manager.into(),
        method: method.into(),
        action: Arc::clone(action),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl StrategyAction for Noop {
        async fn call(&self, _ctx: &Context, _args: Value) -> Result<(), Error> {
            Ok(())
        }
    }

    fn registry() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register(
            TaskManagerStrategy::new("mysql")
                .with_action("grow", Arc::new(Noop))
                .with_action("apply_patch", Arc::new(Noop)),
        );
        registry
    }

    #[test]
    fn resolves_on_first_separator() {
        let registry = registry();
        let resolved = resolve(&registry, "mysql_apply_patch").unwrap();
        assert_eq!(resolved.manager, "mysql");
        assert_eq!(resolved.method, "apply_patch");
        assert_eq!(resolve(&registry, "mysql_grow").unwrap().method, "grow");
    }

    #[test]
    fn unknown_manager_and_unknown_method_are_distinct() {
        let registry = registry();
        match resolve(&registry, "foo_bar") {
            Err(Error::NoStrategy(manager)) => assert_eq!(manager, "foo"),
            other => panic!("unexpected resolution: {other:?}"),
        }
        match resolve(&registry, "mysql_unknownmethod") {
            Err(Error::NoSuchMethod { manager, method }) => {
                assert_eq!(manager, "mysql");
                assert_eq!(method, "unknownmethod");
            }
            other => panic!("unexpected resolution: {other:?}"),
        }
    }

    #[test]
    fn degenerate_names() {
        let registry = registry();
        assert!(matches!(
            resolve(&registry, "_grow"),
            Err(Error::MissingManagerPrefix(_))
        ));
        assert!(matches!(
            resolve(&registry, "mysql"),
            Err(Error::NoSuchMethod { method, .. }) if method.is_empty()
        ));
        assert!(matches!(
            resolve(&registry, "redis"),
            Err(Error::NoStrategy(_))
        ));
    }

    #[test]
    fn register_replaces() {
        let mut registry = registry();
        let previous = registry.register(TaskManagerStrategy::new("mysql"));
        assert!(previous.is_some());
        assert_eq!(registry.managers().collect::<Vec<_>>(), vec!["mysql"]);
        assert!(matches!(
            resolve(&registry, "mysql_grow"),
            Err(Error::NoSuchMethod { .. })
        ));
    }
}
