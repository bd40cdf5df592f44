//! Account provisioning.
//!
//! An account owns a cluster namespace with a resource quota and limit range,
//! an optional copy of the platform TLS secret, a subtree of the store and a
//! host volume directory.

use std::sync::Arc;
use strata_core::cluster::{ClusterDriver, Secret};
use strata_core::state::StackStore;
use strata_core::types::ResourceLimits;
use strata_core::{Account, Caller, Config, Result, StrataError};
use tracing::{debug, info, instrument, warn};

/// Account manager.
#[derive(Clone)]
pub struct AccountManager {
    store: Arc<dyn StackStore>,
    driver: Arc<dyn ClusterDriver>,
    config: Arc<Config>,
}

impl AccountManager {
    pub fn new(store: Arc<dyn StackStore>, driver: Arc<dyn ClusterDriver>, config: Arc<Config>) -> Self {
        Self { store, driver, config }
    }

    fn default_limits(&self) -> ResourceLimits {
        let limits = &self.config.limits;
        ResourceLimits {
            cpu_max: limits.cpu_max,
            cpu_default: limits.cpu_default,
            memory_max: limits.memory_max,
            memory_default: limits.memory_default,
            storage_quota: limits.storage_default,
        }
    }

    /// Register an account and provision its namespace.
    #[instrument(skip(self, account), fields(account = %account.namespace))]
    pub async fn create(&self, mut account: Account) -> Result<Account> {
        if account.namespace.is_empty() {
            return Err(StrataError::InvalidRequest { reason: "namespace is required".to_string() });
        }
        if self.store.get_account(&account.namespace).await?.is_some() {
            return Err(StrataError::AccountExists { account: account.namespace.clone() });
        }

        self.driver.create_namespace(&account.namespace).await?;

        if account.resource_limits.is_unset() {
            warn!("No resource limits specified for account {}, using defaults", account.namespace);
            account.resource_limits = self.default_limits();
        }
        self.apply_limits(&account).await?;
        self.copy_tls_secret(&account.namespace).await?;

        self.store.put_account(&account).await?;
        info!("Created account {}", account.namespace);
        Ok(account)
    }

    /// Replace an account record. Cluster objects are left as they are.
    #[instrument(skip(self, caller, account))]
    pub async fn update(&self, caller: &Caller, namespace: &str, mut account: Account) -> Result<Account> {
        caller.require_account(namespace)?;
        if self.store.get_account(namespace).await?.is_none() {
            return Err(StrataError::AccountNotFound { account: namespace.to_string() });
        }
        account.namespace = namespace.to_string();
        self.store.put_account(&account).await?;
        Ok(account)
    }

    /// Delete an account with its namespace, stored records and volumes.
    #[instrument(skip(self, caller))]
    pub async fn delete(&self, caller: &Caller, namespace: &str) -> Result<()> {
        caller.require_admin()?;
        if self.store.get_account(namespace).await?.is_none() {
            return Err(StrataError::AccountNotFound { account: namespace.to_string() });
        }

        self.driver.delete_namespace(namespace).await?;
        self.store.delete_account(namespace).await?;

        let dir = self.config.account_volume_dir(namespace);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StrataError::IoError { path: dir, source: e }),
        }

        info!("Deleted account {}", namespace);
        Ok(())
    }

    pub async fn get(&self, caller: &Caller, namespace: &str) -> Result<Account> {
        caller.require_account(namespace)?;
        self.store
            .get_account(namespace)
            .await?
            .ok_or_else(|| StrataError::AccountNotFound { account: namespace.to_string() })
    }

    pub async fn list(&self, caller: &Caller) -> Result<Vec<Account>> {
        caller.require_admin()?;
        self.store.list_accounts().await
    }

    /// Recreate the namespace and its limits if the cluster lost them.
    #[instrument(skip(self, account), fields(account = %account.namespace))]
    pub async fn ensure_provisioned(&self, account: &Account) -> Result<()> {
        if self.driver.namespace_exists(&account.namespace).await? {
            debug!("Namespace {} exists", account.namespace);
            return Ok(());
        }
        info!("Recreating namespace {}", account.namespace);
        self.driver.create_namespace(&account.namespace).await?;
        self.apply_limits(account).await
    }

    async fn apply_limits(&self, account: &Account) -> Result<()> {
        if !account.resource_limits.has_quota() {
            return Ok(());
        }
        self.driver.create_resource_quota(&account.namespace, &account.resource_limits).await?;
        self.driver.create_limit_range(&account.namespace, &account.resource_limits).await
    }

    async fn copy_tls_secret(&self, namespace: &str) -> Result<()> {
        let platform = self
            .driver
            .get_secret(&self.config.tls_secret_namespace, &self.config.tls_secret)
            .await?;
        if let Some(platform) = platform {
            let secret = Secret { name: Config::account_tls_secret(namespace), data: platform.data };
            self.driver.create_secret(namespace, &secret).await?;
            debug!("Copied TLS secret into {}", namespace);
        }
        Ok(())
    }
}
