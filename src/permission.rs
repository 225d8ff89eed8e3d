//! Principal identities and the permission-check seam consulted by storage
//! node message handlers before they act on a request.

use std::collections::{HashMap, HashSet};

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{LogId, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub enum Principal {
    /// Another server of this cluster (sequencer or storage node).
    ClusterNode(NodeId),
    Authenticated(String),
    Unauthenticated,
}

impl Principal {
    pub fn is_cluster_node(&self) -> bool {
        matches!(self, Principal::ClusterNode(_))
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Principal::ClusterNode(id) => write!(f, "node:{}", id),
            Principal::Authenticated(who) => write!(f, "user:{}", who),
            Principal::Unauthenticated => write!(f, "unauthenticated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Append,
    Read,
    Trim,
    /// Only servers may seal or write recovery copies.
    ServerInternal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Allowed,
    Denied,
    /// 权限数据尚未就绪，结果不确定
    NotReady,
}

pub trait PermissionChecker: Send + Sync {
    fn check(&self, principal: &Principal, action: Action, log: LogId) -> PermissionStatus;
}

/// Checker used when authorization is disabled.
#[derive(Debug, Default, Clone)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn check(&self, _principal: &Principal, _action: Action, _log: LogId) -> PermissionStatus {
        PermissionStatus::Allowed
    }
}

/// Table-driven checker keyed by authenticated identity.
#[derive(Debug, Clone)]
pub struct StaticPermissionChecker {
    grants: HashMap<String, HashSet<Action>>,
    ready: bool,
}

impl StaticPermissionChecker {
    pub fn new() -> Self {
        Self {
            grants: HashMap::new(),
            ready: true,
        }
    }

    pub fn grant(mut self, identity: impl Into<String>, actions: &[Action]) -> Self {
        self.grants
            .entry(identity.into())
            .or_default()
            .extend(actions.iter().copied());
        self
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }
}

impl PermissionChecker for StaticPermissionChecker {
    fn check(&self, principal: &Principal, action: Action, _log: LogId) -> PermissionStatus {
        if !self.ready {
            return PermissionStatus::NotReady;
        }
        match principal {
            Principal::ClusterNode(_) => PermissionStatus::Allowed,
            Principal::Authenticated(who) => match self.grants.get(who) {
                Some(actions) if actions.contains(&action) => PermissionStatus::Allowed,
                _ => PermissionStatus::Denied,
            },
            Principal::Unauthenticated => PermissionStatus::Denied,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Normal,
    Denied(String),
    /// Could not decide; the sender should try elsewhere.
    Retry(String),
}

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Actions that go through the permission checker.
    pub require_permission: HashSet<Action>,
    /// Reject server-internal actions from principals that are not cluster nodes.
    pub enforce_internal: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            require_permission: [Action::Append, Action::Read, Action::Trim]
                .into_iter()
                .collect(),
            enforce_internal: true,
        }
    }
}

/// 消息处理前的统一鉴权
pub fn authorize(
    checker: &dyn PermissionChecker,
    options: &DispatchOptions,
    principal: &Principal,
    action: Action,
    log: LogId,
) -> Disposition {
    if action == Action::ServerInternal {
        if principal.is_cluster_node() || !options.enforce_internal {
            return Disposition::Normal;
        }
        warn!(
            "Rejecting server-internal request for {} from {}",
            log, principal
        );
        return Disposition::Denied(format!("{} is not a cluster node", principal));
    }

    if !options.require_permission.contains(&action) {
        return Disposition::Normal;
    }

    match checker.check(principal, action, log) {
        PermissionStatus::Allowed => Disposition::Normal,
        PermissionStatus::Denied => {
            Disposition::Denied(format!("{} may not {:?} {}", principal, action, log))
        }
        PermissionStatus::NotReady => Disposition::Retry("permission checker not ready".into()),
    }
}
