//! Per-user collaborators: plan limits and catalog credentials.

use crate::types::Plan;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;

/// Looks up the subscription plan of a user
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn get_plan(&self, user_id: &str) -> Result<Plan>;
}

/// Resolves a user's current catalog access token
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn get_access_token(&self, user_id: &str) -> Result<String>;
}

/// Plans from configuration: a default plus per-user overrides
#[derive(Debug, Clone, Default)]
pub struct StaticPlans {
    default: Plan,
    users: HashMap<String, Plan>,
}

impl StaticPlans {
    pub fn new(default: Plan, users: HashMap<String, Plan>) -> Self {
        Self { default, users }
    }
}

#[async_trait]
impl PlanProvider for StaticPlans {
    async fn get_plan(&self, user_id: &str) -> Result<Plan> {
        Ok(self.users.get(user_id).unwrap_or(&self.default).clone())
    }
}

/// Tokens from configuration, keyed by user id
#[derive(Clone, Default)]
pub struct StaticCredentials {
    tokens: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn get_access_token(&self, user_id: &str) -> Result<String> {
        self.tokens
            .get(user_id)
            .cloned()
            .with_context(|| format!("No access token configured for user {}", user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_plans_fall_back_to_default() {
        let pro = Plan {
            name: "pro".to_string(),
            max_operations: 200,
            ..Plan::default()
        };
        let plans = StaticPlans::new(Plan::default(), HashMap::from([("u1".to_string(), pro)]));

        assert_eq!(plans.get_plan("u1").await.unwrap().name, "pro");
        assert_eq!(plans.get_plan("u2").await.unwrap().name, "free");
    }

    #[tokio::test]
    async fn test_missing_token_is_an_error() {
        let credentials =
            StaticCredentials::new(HashMap::from([("u1".to_string(), "secret".to_string())]));

        assert_eq!(credentials.get_access_token("u1").await.unwrap(), "secret");
        let err = credentials.get_access_token("u2").await.unwrap_err();
        assert!(err.to_string().contains("u2"));
    }
}
