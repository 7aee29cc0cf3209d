/*!
 * # Actors and permissions
 *
 * The engine does not authenticate anybody. Callers hand it an [`Actor`]
 * (who is acting) and the engine asks a [`PermissionChecker`] whether that
 * actor may perform an [`Action`]. Identity comes from the surrounding
 * platform; over HTTP it is read from the `x-actor-id` / `x-actor-name`
 * headers.
 */

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use strum::{AsRefStr, Display, EnumIter, EnumString};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_NAME_HEADER: &str = "x-actor-name";

const SYSTEM_ACTOR_ID: &str = "system";

/// Who is performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub actor_name: Option<String>,
}

impl Actor {
    pub fn new(actor_id: impl Into<String>, actor_name: Option<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_name,
        }
    }

    /// Actor used by background work such as the zombie sweeper
    pub fn system() -> Self {
        Self {
            actor_id: SYSTEM_ACTOR_ID.to_string(),
            actor_name: Some("Zombie sweeper".to_string()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.actor_id == SYSTEM_ACTOR_ID
    }

    /// Name for audit and log output, falling back to the id
    pub fn display_name(&self) -> &str {
        self.actor_name.as_deref().unwrap_or(&self.actor_id)
    }
}

/// Capabilities gated by the permission provider
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Action {
    Reserve,
    Consume,
    Release,
    Finalize,
    Cancel,
    Recover,
    ManageBins,
    ReceiveStock,
}

/// Opaque capability predicate supplied by the identity platform
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_perform(&self, actor_id: &str, action: Action) -> bool;
}

/// Grants everything. Used when no permission provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn can_perform(&self, _actor_id: &str, _action: Action) -> bool {
        true
    }
}

/// Fixed actor to action grants
#[derive(Debug, Clone, Default)]
pub struct StaticPermissions {
    grants: HashMap<String, HashSet<Action>>,
}

impl StaticPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor_id: impl Into<String>, actions: &[Action]) -> Self {
        self.grants
            .entry(actor_id.into())
            .or_default()
            .extend(actions.iter().copied());
        self
    }

    pub fn grant_all(self, actor_id: impl Into<String>) -> Self {
        use strum::IntoEnumIterator;
        let all: Vec<Action> = Action::iter().collect();
        self.grant(actor_id, &all)
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn can_perform(&self, actor_id: &str, action: Action) -> bool {
        self.grants
            .get(actor_id)
            .map_or(false, |actions| actions.contains(&action))
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let actor_id = header(ACTOR_ID_HEADER).ok_or((
            StatusCode::UNAUTHORIZED,
            "missing x-actor-id header",
        ))?;

        Ok(Actor {
            actor_id,
            actor_name: header(ACTOR_NAME_HEADER),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn static_permissions_only_grant_listed_actions() {
        let perms = StaticPermissions::new()
            .grant("picker-1", &[Action::Reserve, Action::Cancel])
            .grant_all("supervisor");

        assert!(perms.can_perform("picker-1", Action::Reserve).await);
        assert!(!perms.can_perform("picker-1", Action::Consume).await);
        assert!(perms.can_perform("supervisor", Action::Recover).await);
        assert!(!perms.can_perform("stranger", Action::Reserve).await);
    }

    #[tokio::test]
    async fn allow_all_grants_everything() {
        assert!(AllowAll.can_perform("anyone", Action::ManageBins).await);
    }

    #[test]
    fn action_names_are_snake_case() {
        assert_eq!(Action::ManageBins.to_string(), "manage_bins");
        assert_eq!(Action::from_str("receive_stock").unwrap(), Action::ReceiveStock);
    }

    #[test]
    fn display_name_falls_back_to_id() {
        assert_eq!(Actor::new("u-7", None).display_name(), "u-7");
        assert_eq!(
            Actor::new("u-7", Some("Ana".into())).display_name(),
            "Ana"
        );
        assert!(Actor::system().is_system());
    }
}
