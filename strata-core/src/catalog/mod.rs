//! Two-tier service catalog.
//!
//! System entries are visible to every account and only administrators may
//! change them. Each account additionally owns a private catalog whose
//! entries shadow system entries with the same key.

use crate::error::{Result, StrataError};
use crate::graph::DependencyGraph;
use crate::state::StackStore;
use crate::types::{CatalogScope, ConfigVar, ServiceSpec, Vocabulary};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub mod loader;

pub use loader::{load_specs, LoadSummary};

/// Identity a request is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Account namespace; empty for administrators acting on their own behalf
    pub account: String,
    pub admin: bool,
}

impl Caller {
    pub fn user(account: impl Into<String>) -> Self {
        Self { account: account.into(), admin: false }
    }

    pub fn admin() -> Self {
        Self { account: String::new(), admin: true }
    }

    /// Fail unless the caller is an administrator.
    pub fn require_admin(&self) -> Result<()> {
        if self.admin {
            Ok(())
        } else {
            Err(StrataError::unauthorized("administrator access required"))
        }
    }

    /// Fail unless the caller is an administrator or owns `account`.
    pub fn require_account(&self, account: &str) -> Result<()> {
        if self.admin || self.account == account {
            Ok(())
        } else {
            Err(StrataError::unauthorized(format!("no access to account {}", account)))
        }
    }
}

/// Which entries a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogView {
    System,
    #[default]
    User,
    /// Both tiers, user entries shadowing system ones
    All,
}

/// Catalog operations on top of a [`StackStore`].
#[derive(Clone)]
pub struct ServiceCatalog {
    store: Arc<dyn StackStore>,
}

impl ServiceCatalog {
    pub fn new(store: Arc<dyn StackStore>) -> Self {
        Self { store }
    }

    pub async fn list(&self, caller: &Caller, view: CatalogView) -> Result<Vec<ServiceSpec>> {
        match view {
            CatalogView::System => self.store.list_global_services().await,
            CatalogView::User => self.store.list_services(&caller.account).await,
            CatalogView::All => self.store.list_all_services(&caller.account).await,
        }
    }

    /// Resolve `key` for the caller, user tier first.
    pub async fn get(&self, caller: &Caller, key: &str) -> Result<ServiceSpec> {
        self.store
            .get_service_spec(&caller.account, key)
            .await?
            .ok_or_else(|| StrataError::ServiceNotFound { key: key.to_string() })
    }

    pub async fn exists(&self, caller: &Caller, key: &str) -> Result<bool> {
        Ok(self.store.get_service_spec(&caller.account, key).await?.is_some())
    }

    /// Register a new entry.
    #[instrument(skip(self, spec), fields(account = %caller.account, key = %spec.key))]
    pub async fn add(&self, caller: &Caller, scope: CatalogScope, spec: ServiceSpec) -> Result<()> {
        if scope == CatalogScope::System {
            caller.require_admin()?;
        }
        validate_spec(&spec)?;
        if self.exists(caller, &spec.key).await? {
            return Err(StrataError::ServiceExists { key: spec.key.clone() });
        }
        self.check_acyclic(caller, scope, &spec).await?;

        self.store.put_service_spec(scope, &caller.account, &spec).await?;
        info!("Added {} service {}", scope, spec.key);
        Ok(())
    }

    /// Replace an entry. Refused while any stack references the key.
    #[instrument(skip(self, spec), fields(account = %caller.account))]
    pub async fn update(
        &self,
        caller: &Caller,
        scope: CatalogScope,
        key: &str,
        mut spec: ServiceSpec,
    ) -> Result<ServiceSpec> {
        if scope == CatalogScope::System {
            caller.require_admin()?;
        }
        spec.key = key.to_string();
        validate_spec(&spec)?;

        let count = self.usage_count(key).await?;
        if count > 0 {
            warn!("Cannot update service spec {} because it is in use", key);
            return Err(StrataError::ServiceInUse { key: key.to_string(), count });
        }
        self.check_acyclic(caller, scope, &spec).await?;

        self.store.put_service_spec(scope, &caller.account, &spec).await?;
        info!("Updated {} service {}", scope, key);
        spec.catalog = scope;
        Ok(spec)
    }

    /// Remove an entry that nothing depends on and no stack uses.
    #[instrument(skip(self), fields(account = %caller.account))]
    pub async fn delete(&self, caller: &Caller, scope: CatalogScope, key: &str) -> Result<()> {
        let dependents = match scope {
            CatalogScope::System => {
                caller.require_admin()?;
                if self.store.get_service_spec(&caller.account, key).await?.is_none() {
                    return Err(StrataError::ServiceNotFound { key: key.to_string() });
                }
                self.store.list_global_services().await?
            }
            CatalogScope::User => {
                match self.store.get_service_spec(&caller.account, key).await? {
                    Some(spec) if spec.catalog == CatalogScope::User => {}
                    _ => return Err(StrataError::ServiceNotFound { key: key.to_string() }),
                }
                self.store.list_services(&caller.account).await?
            }
        };

        if dependents.iter().any(|spec| spec.dependency(key).is_some()) {
            warn!("Cannot delete service spec {} because it is required by another service", key);
            return Err(StrataError::ServiceRequired { key: key.to_string() });
        }

        let count = self.usage_count(key).await?;
        if count > 0 {
            warn!("Cannot delete service spec {} because it is in use", key);
            return Err(StrataError::ServiceInUse { key: key.to_string(), count });
        }

        self.store.delete_service_spec(scope, &caller.account, key).await?;
        info!("Deleted {} service {}", scope, key);
        Ok(())
    }

    /// Declared configuration variables of each key.
    pub async fn configs(
        &self,
        caller: &Caller,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<ConfigVar>>> {
        let mut configs = BTreeMap::new();
        for key in keys {
            let spec = self.get(caller, key).await?;
            configs.insert(key.clone(), spec.config);
        }
        Ok(configs)
    }

    /// Number of stack services, across every account, instantiating `key`.
    pub async fn usage_count(&self, key: &str) -> Result<usize> {
        let mut count = 0;
        for account in self.store.list_accounts().await? {
            for stack in self.store.list_stacks(&account.namespace).await? {
                count += stack.services.iter().filter(|s| s.service == key).count();
            }
        }
        Ok(count)
    }

    pub async fn vocabulary(&self, name: &str) -> Result<Vocabulary> {
        self.store
            .get_vocabulary(name)
            .await?
            .ok_or_else(|| StrataError::VocabularyNotFound { name: name.to_string() })
    }

    /// Reject `candidate` if it closes a dependency cycle in the catalog it
    /// is being written to. User entries may depend on system entries, so a
    /// user write is checked against the merged view.
    async fn check_acyclic(
        &self,
        caller: &Caller,
        scope: CatalogScope,
        candidate: &ServiceSpec,
    ) -> Result<()> {
        let existing = match scope {
            CatalogScope::System => self.store.list_global_services().await?,
            CatalogScope::User => self.store.list_all_services(&caller.account).await?,
        };
        let specs: Vec<&ServiceSpec> = existing
            .iter()
            .filter(|spec| spec.key != candidate.key)
            .chain(std::iter::once(candidate))
            .collect();
        DependencyGraph::from_catalog(specs).validate()
    }
}

fn validate_spec(spec: &ServiceSpec) -> Result<()> {
    if spec.key.is_empty() || spec.key.contains('/') {
        return Err(StrataError::InvalidRequest {
            reason: format!("invalid service key '{}'", spec.key),
        });
    }
    if spec.image.is_empty() {
        return Err(StrataError::InvalidRequest {
            reason: format!("service {} has no image", spec.key),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateManager;
    use crate::types::{Account, Dependency, Stack, StackService};

    async fn catalog() -> (ServiceCatalog, Arc<StateManager>) {
        let store = Arc::new(StateManager::new_in_memory().await.unwrap());
        (ServiceCatalog::new(store.clone()), store)
    }

    fn depends_on(key: &str, dep: &str) -> ServiceSpec {
        let mut spec = ServiceSpec::new(key, "busybox");
        spec.dependencies =
            vec![Dependency { key: dep.to_string(), required: true, share_config: false }];
        spec
    }

    #[tokio::test]
    async fn test_system_scope_requires_admin() {
        let (catalog, _) = catalog().await;
        let err = catalog
            .add(&Caller::user("demo"), CatalogScope::System, ServiceSpec::new("db", "postgres"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Unauthorized { .. }));

        catalog
            .add(&Caller::admin(), CatalogScope::System, ServiceSpec::new("db", "postgres"))
            .await
            .unwrap();
        let spec = catalog.get(&Caller::user("demo"), "db").await.unwrap();
        assert_eq!(spec.catalog, CatalogScope::System);

        // Authorization is checked before the key is looked up
        let err = catalog
            .add(&Caller::user("demo"), CatalogScope::System, ServiceSpec::new("db", "mysql"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_key_conflicts() {
        let (catalog, _) = catalog().await;
        catalog
            .add(&Caller::admin(), CatalogScope::System, ServiceSpec::new("db", "postgres"))
            .await
            .unwrap();

        // Already resolves for the user through the system tier
        let err = catalog
            .add(&Caller::user("demo"), CatalogScope::User, ServiceSpec::new("db", "mysql"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ServiceExists { .. }));
    }

    #[tokio::test]
    async fn test_cycle_rejected_at_registration() {
        let (catalog, _) = catalog().await;
        let admin = Caller::admin();
        catalog.add(&admin, CatalogScope::System, depends_on("a", "b")).await.unwrap();
        catalog.add(&admin, CatalogScope::System, depends_on("b", "c")).await.unwrap();

        let err = catalog.add(&admin, CatalogScope::System, depends_on("c", "a")).await.unwrap_err();
        assert!(matches!(err, StrataError::CircularDependency { .. }));
        assert!(!catalog.exists(&admin, "c").await.unwrap());

        // A user entry closing the loop through system entries is caught too
        let err = catalog
            .add(&Caller::user("demo"), CatalogScope::User, depends_on("c", "a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::CircularDependency { .. }));
    }

    #[tokio::test]
    async fn test_delete_guards() {
        let (catalog, store) = catalog().await;
        let admin = Caller::admin();
        catalog.add(&admin, CatalogScope::System, ServiceSpec::new("db", "postgres")).await.unwrap();
        catalog.add(&admin, CatalogScope::System, depends_on("web", "db")).await.unwrap();

        let err = catalog.delete(&admin, CatalogScope::System, "db").await.unwrap_err();
        assert!(matches!(err, StrataError::ServiceRequired { .. }));

        store
            .put_account(&Account { namespace: "demo".into(), ..Default::default() })
            .await
            .unwrap();
        let mut stack = Stack::new("web", "blog").with_service(StackService::new("web"));
        stack.id = "k3x9q".into();
        store.put_stack("demo", &stack).await.unwrap();

        let err = catalog.delete(&admin, CatalogScope::System, "web").await.unwrap_err();
        assert!(matches!(err, StrataError::ServiceInUse { count: 1, .. }));
        let err = catalog
            .update(&admin, CatalogScope::System, "web", ServiceSpec::new("web", "nginx"))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::ServiceInUse { .. }));

        store.delete_stack("demo", "k3x9q").await.unwrap();
        catalog.delete(&admin, CatalogScope::System, "web").await.unwrap();
        catalog.delete(&admin, CatalogScope::System, "db").await.unwrap();

        let err = catalog.delete(&admin, CatalogScope::System, "db").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_user_delete_only_touches_user_entries() {
        let (catalog, _) = catalog().await;
        catalog
            .add(&Caller::admin(), CatalogScope::System, ServiceSpec::new("db", "postgres"))
            .await
            .unwrap();

        let user = Caller::user("demo");
        let err = catalog.delete(&user, CatalogScope::User, "db").await.unwrap_err();
        assert!(err.is_not_found());

        catalog.add(&user, CatalogScope::User, ServiceSpec::new("notebook", "jupyter")).await.unwrap();
        assert_eq!(catalog.list(&user, CatalogView::User).await.unwrap().len(), 1);
        assert_eq!(catalog.list(&user, CatalogView::All).await.unwrap().len(), 2);
        assert_eq!(catalog.list(&user, CatalogView::System).await.unwrap().len(), 1);

        catalog.delete(&user, CatalogScope::User, "notebook").await.unwrap();
        assert!(catalog.list(&user, CatalogView::User).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_configs() {
        let (catalog, _) = catalog().await;
        let mut spec = ServiceSpec::new("db", "postgres");
        spec.config = vec![ConfigVar {
            name: "POSTGRES_PASSWORD".into(),
            value: String::new(),
            can_override: true,
            is_password: true,
        }];
        catalog.add(&Caller::admin(), CatalogScope::System, spec).await.unwrap();

        let user = Caller::user("demo");
        let configs = catalog.configs(&user, &["db".to_string()]).await.unwrap();
        assert!(configs["db"][0].is_password);

        let err = catalog.configs(&user, &["absent".to_string()]).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
