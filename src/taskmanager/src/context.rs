// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Caller identity.

use derivative::Derivative;
use tokio_util::sync::CancellationToken;

use crate::config::AdminCredentials;

/// The identity on whose behalf an operation runs.
///
/// Caller-driven operations receive the caller's context from the transport.
/// Work the task manager starts on its own (see [`crate::periodic`]) runs with
/// the administrative context built once from [`AdminCredentials`].
///
/// A context also carries the cancellation scope of the call. Waits inside
/// replication topology changes observe it, so cancelling the token aborts a
/// stalled topology change instead of blocking it until the transport gives
/// up.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct Context {
    /// The user issuing the call.
    pub user: String,
    /// The tenant the user acts within.
    pub tenant_id: String,
    /// Credential forwarded to downstream services.
    #[derivative(Debug = "ignore")]
    pub auth_token: Option<String>,
    /// Whether this is the task manager's own administrative identity.
    pub is_admin: bool,
    #[derivative(Debug = "ignore")]
    cancel: CancellationToken,
}

impl Context {
    /// Creates a context for `user` acting within `tenant_id`.
    pub fn new(user: impl Into<String>, tenant_id: impl Into<String>) -> Context {
        Context {
            user: user.into(),
            tenant_id: tenant_id.into(),
            auth_token: None,
            is_admin: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Creates the administrative context described by `credentials`.
    pub fn admin(credentials: &AdminCredentials) -> Context {
        Context {
            user: credentials.user.clone(),
            tenant_id: credentials.tenant_id.clone(),
            auth_token: Some(credentials.password.clone()),
            is_admin: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Context {
        self.auth_token = Some(token.into());
        self
    }

    /// Replaces the cancellation scope of this context.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Context {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
