//! Storage seam for accounts, stacks and the service catalog.

use crate::error::{Result, StrataError};
use crate::events::EventBus;
use crate::observability::metrics;
use crate::types::{Account, CatalogScope, ServiceSpec, Stack, Vocabulary};
use async_trait::async_trait;
use tracing::{debug, warn};

/// Attempts made by [`update_stack`] before reporting a write conflict.
pub const MAX_UPDATE_ATTEMPTS: usize = 32;

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new revision.
    Stored(u64),
    /// The record moved on; carries the current revision.
    Conflict(u64),
    /// The record does not exist.
    Missing,
}

/// Key layout of the hierarchical store.
pub mod keys {
    pub const ACCOUNTS_PREFIX: &str = "/accounts/";
    pub const SYSTEM_SERVICES_PREFIX: &str = "/services/";

    pub fn account(account: &str) -> String {
        format!("/accounts/{}/account", account)
    }

    /// Everything owned by an account.
    pub fn account_subtree(account: &str) -> String {
        format!("/accounts/{}/", account)
    }

    pub fn stack(account: &str, stack_id: &str) -> String {
        format!("/accounts/{}/stacks/{}", account, stack_id)
    }

    pub fn stacks(account: &str) -> String {
        format!("/accounts/{}/stacks/", account)
    }

    pub fn user_service(account: &str, key: &str) -> String {
        format!("/accounts/{}/services/{}", account, key)
    }

    pub fn user_services(account: &str) -> String {
        format!("/accounts/{}/services/", account)
    }

    pub fn system_service(key: &str) -> String {
        format!("{}{}", SYSTEM_SERVICES_PREFIX, key)
    }

    pub fn vocabulary(name: &str) -> String {
        format!("/vocabularies/{}", name)
    }

    /// Namespace of an account record key, if `key` is one.
    pub fn account_of(key: &str) -> Option<&str> {
        key.strip_prefix(ACCOUNTS_PREFIX)
            .and_then(|rest| rest.strip_suffix("/account"))
            .filter(|ns| !ns.is_empty() && !ns.contains('/'))
    }
}

/// Durable state shared by every lifecycle task.
///
/// Stack records carry a revision. Writers that race other writers go
/// through [`update_stack`], which re-reads and retries on conflict.
#[async_trait]
pub trait StackStore: Send + Sync {
    async fn get_account(&self, account: &str) -> Result<Option<Account>>;

    async fn put_account(&self, account: &Account) -> Result<()>;

    /// Remove the account record and everything beneath it.
    async fn delete_account(&self, account: &str) -> Result<()>;

    async fn list_accounts(&self) -> Result<Vec<Account>>;

    async fn get_stack(&self, account: &str, stack_id: &str) -> Result<Option<Stack>>;

    /// Unconditional write. Returns the new revision.
    async fn put_stack(&self, account: &str, stack: &Stack) -> Result<u64>;

    /// Write only if the stored revision still equals `stack.revision`.
    async fn compare_and_put_stack(&self, account: &str, stack: &Stack) -> Result<CasOutcome>;

    async fn delete_stack(&self, account: &str, stack_id: &str) -> Result<()>;

    async fn list_stacks(&self, account: &str) -> Result<Vec<Stack>>;

    /// Resolve a catalog key: the account's own entry wins over the system one.
    async fn get_service_spec(&self, account: &str, key: &str) -> Result<Option<ServiceSpec>>;

    async fn put_service_spec(
        &self,
        scope: CatalogScope,
        account: &str,
        spec: &ServiceSpec,
    ) -> Result<()>;

    async fn delete_service_spec(&self, scope: CatalogScope, account: &str, key: &str)
        -> Result<()>;

    /// Entries in the account's own catalog.
    async fn list_services(&self, account: &str) -> Result<Vec<ServiceSpec>>;

    /// Entries in the system catalog.
    async fn list_global_services(&self) -> Result<Vec<ServiceSpec>>;

    /// Merged view of both catalogs, user entries shadowing system ones.
    async fn list_all_services(&self, account: &str) -> Result<Vec<ServiceSpec>> {
        let mut merged: std::collections::BTreeMap<String, ServiceSpec> = self
            .list_global_services()
            .await?
            .into_iter()
            .map(|spec| (spec.key.clone(), spec))
            .collect();
        for spec in self.list_services(account).await? {
            merged.insert(spec.key.clone(), spec);
        }
        Ok(merged.into_values().collect())
    }

    async fn get_vocabulary(&self, name: &str) -> Result<Option<Vocabulary>>;

    async fn put_vocabulary(&self, vocabulary: &Vocabulary) -> Result<()>;

    /// Change notifications for every write made through this store.
    fn events(&self) -> &EventBus;
}

/// Fetch a stack or fail with `StackNotFound`.
pub async fn require_stack(store: &dyn StackStore, account: &str, stack_id: &str) -> Result<Stack> {
    store.get_stack(account, stack_id).await?.ok_or_else(|| StrataError::StackNotFound {
        account: account.to_string(),
        stack_id: stack_id.to_string(),
    })
}

/// Read-modify-write a stack under optimistic concurrency.
///
/// `mutate` is applied to a fresh copy on every attempt and returns whether
/// it changed anything; `Ok(false)` skips the write. An error from `mutate`
/// aborts without writing. Returns the stack as stored.
pub async fn update_stack<F>(
    store: &dyn StackStore,
    account: &str,
    stack_id: &str,
    mut mutate: F,
) -> Result<Stack>
where
    F: FnMut(&mut Stack) -> Result<bool> + Send,
{
    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut stack = require_stack(store, account, stack_id).await?;
        if !mutate(&mut stack)? {
            return Ok(stack);
        }
        stack.updated_at = Some(chrono::Utc::now());

        match store.compare_and_put_stack(account, &stack).await? {
            CasOutcome::Stored(revision) => {
                stack.revision = revision;
                return Ok(stack);
            }
            CasOutcome::Conflict(current) => {
                metrics::record_store_conflict();
                debug!(
                    stack_id,
                    attempt,
                    expected = stack.revision,
                    current,
                    "Stack changed underneath, retrying"
                );
                tokio::task::yield_now().await;
            }
            CasOutcome::Missing => {
                return Err(StrataError::StackNotFound {
                    account: account.to_string(),
                    stack_id: stack_id.to_string(),
                });
            }
        }
    }

    warn!(stack_id, "Giving up on stack update after {} attempts", MAX_UPDATE_ATTEMPTS);
    Err(StrataError::WriteConflict {
        key: keys::stack(account, stack_id),
        attempts: MAX_UPDATE_ATTEMPTS,
    })
}
