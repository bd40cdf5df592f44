//! Stack lifecycle orchestration.
//!
//! Drives the cluster to realize (or tear down) every service of a stack in
//! dependency order and settles the persisted stack status. Status changes of
//! individual services are written by the [`EventReconciler`]; the
//! orchestrator only observes them through the store, waking on change
//! notifications with the poll interval as a ceiling.
//!
//! [`EventReconciler`]: super::EventReconciler

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use strata_core::cluster::{
    controller_template, service_template, ClusterDriver, IngressSpec, PodPhase, PodState,
    ServiceAddress, TemplateContext, LABEL_NAME, LABEL_SERVICE, LABEL_STACK,
};
use strata_core::events::EventSubscriber;
use strata_core::observability::metrics;
use strata_core::state::{self, require_stack, StackStore};
use strata_core::types::{
    stack_id_of, stack_service_id, Access, Endpoint, ServiceSpec, ServiceStatus, Stack,
    StackService, StackStatus,
};
use strata_core::{volumes, Config, DependencyGraph, Result, StrataError};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Length of generated stack ids.
pub const STACK_ID_LEN: usize = 5;

/// Length of generated scratch-path suffixes.
const SUFFIX_LEN: usize = 5;

const MAX_ID_ATTEMPTS: usize = 8;

/// Everything a start pass shares with its controller tasks.
struct StartPass {
    account: String,
    stack_id: String,
    specs: BTreeMap<String, ServiceSpec>,
    graph: DependencyGraph,
    /// Realized cluster services by catalog key
    addresses: BTreeMap<String, ServiceAddress>,
}

/// Decrements the in-flight gauge when a lifecycle operation ends.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::adjust_in_flight(1.0);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::adjust_in_flight(-1.0);
    }
}

/// Stack orchestrator.
#[derive(Clone)]
pub struct StackOrchestrator {
    store: Arc<dyn StackStore>,
    driver: Arc<dyn ClusterDriver>,
    config: Arc<Config>,
}

impl StackOrchestrator {
    /// Create a new stack orchestrator.
    pub fn new(store: Arc<dyn StackStore>, driver: Arc<dyn ClusterDriver>, config: Arc<Config>) -> Self {
        Self { store, driver, config }
    }

    fn store(&self) -> &dyn StackStore {
        &*self.store
    }

    fn subscribe(&self) -> EventSubscriber {
        self.store.events().subscribe(vec!["stack.*".to_string()])
    }

    // ========================
    // Start
    // ========================

    /// Start a stopped stack and run until every launched service settled.
    ///
    /// Fails with `InvalidStackState` unless the stack is stopped. The
    /// stopped -> starting transition is a compare-and-swap, so of two
    /// concurrent requests only one proceeds. Partial failure is reported
    /// through the returned stack, not as an error.
    #[instrument(skip(self), fields(account = %account, stack_id = %stack_id))]
    pub async fn start(&self, account: &str, stack_id: &str) -> Result<Stack> {
        let stack = state::update_stack(self.store(), account, stack_id, |stack| {
            if stack.status != StackStatus::Stopped {
                return Err(StrataError::InvalidStackState {
                    stack_id: stack.id.clone(),
                    status: stack.status.to_string(),
                    expected: StackStatus::Stopped.to_string(),
                });
            }
            stack.status = StackStatus::Starting;
            for service in &mut stack.services {
                service.status = ServiceStatus::Unset;
            }
            Ok(true)
        })
        .await?;

        info!("Starting stack {}", stack.id);
        self.run_start(account, stack).await
    }

    /// Re-enter a start interrupted by a restart. Skips the stopped check.
    ///
    /// Persisted service statuses predate the restart: a service stays ready
    /// only while a running, ready pod backs it and is reset otherwise.
    #[instrument(skip(self), fields(account = %account, stack_id = %stack_id))]
    pub async fn resume_start(&self, account: &str, stack_id: &str) -> Result<Stack> {
        let current = require_stack(self.store(), account, stack_id).await?;
        let mut live = BTreeSet::new();
        for service in &current.services {
            match self.driver.list_pods(account, LABEL_NAME, &service.id).await {
                Ok(pods) => {
                    if pods.iter().any(|p| p.phase == PodPhase::Running && pod_ready(p)) {
                        live.insert(service.service.clone());
                    }
                }
                Err(e) => warn!(service = %service.id, error = %e, "Error listing pods"),
            }
        }

        let stack = state::update_stack(self.store(), account, stack_id, |stack| {
            stack.status = StackStatus::Starting;
            for service in &mut stack.services {
                service.status = if live.contains(&service.service) {
                    ServiceStatus::Ready
                } else {
                    ServiceStatus::Unset
                };
            }
            Ok(true)
        })
        .await?;

        info!("Resuming start of stack {}", stack.id);
        self.run_start(account, stack).await
    }

    async fn run_start(&self, account: &str, stack: Stack) -> Result<Stack> {
        let _in_flight = InFlight::enter();
        let started_at = Instant::now();
        let stack_id = stack.id.clone();
        let mut events = self.subscribe();

        let mut specs = BTreeMap::new();
        for service in &stack.services {
            match self.store.get_service_spec(account, &service.service).await? {
                Some(spec) => {
                    specs.insert(service.service.clone(), spec);
                }
                None => {
                    self.fail_service(
                        account,
                        &stack_id,
                        &service.service,
                        format!("Service spec {} not found", service.service),
                    )
                    .await?;
                }
            }
        }

        let addresses = self.realize_services(account, &stack, &specs).await?;

        let graph = DependencyGraph::for_members(specs.values());
        if let Err(StrataError::CircularDependency { service }) = graph.validate() {
            error!(service = %service, "Dependency cycle in stack");
            self.fail_service(
                account,
                &stack_id,
                &service,
                format!("Circular dependency detected in service: {}", service),
            )
            .await?;
        }

        let pass = Arc::new(StartPass {
            account: account.to_string(),
            stack_id: stack_id.clone(),
            specs,
            graph,
            addresses,
        });

        // Launch every service whose required dependencies are ready. Once any
        // service errors no new launch is issued; launched tasks run on.
        let mut attempted = BTreeSet::new();
        let mut tasks = JoinSet::new();
        let mut lost = false;
        loop {
            let snapshot = require_stack(self.store(), account, &stack_id).await?;
            if snapshot.has_error() {
                warn!("Service in error, no further services will be launched");
                break;
            }

            for service in &snapshot.services {
                if attempted.contains(&service.service) || !pass.specs.contains_key(&service.service) {
                    continue;
                }
                let blocked = pass.graph.required_dependencies(&service.service).iter().any(|dep| {
                    snapshot.service(dep).map_or(false, |s| s.status != ServiceStatus::Ready)
                });
                if blocked {
                    continue;
                }

                debug!(service = %service.service, "Launching controller");
                attempted.insert(service.service.clone());
                let this = self.clone();
                let pass = pass.clone();
                let key = service.service.clone();
                tasks.spawn(async move {
                    let result = this.start_controller(&pass, &key).await;
                    (key, result)
                });
            }

            if attempted.len() == snapshot.services.len() {
                break;
            }
            tokio::select! {
                _ = events.wait_for_stack(account, &stack_id, self.config.poll_interval()) => {}
                Some(joined) = tasks.join_next() => {
                    if !self.reap(account, &stack_id, joined).await? {
                        lost = true;
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if !self.reap(account, &stack_id, joined).await? {
                lost = true;
            }
        }
        if lost {
            for key in &attempted {
                self.fail_pending(
                    account,
                    &stack_id,
                    key,
                    "Controller task ended unexpectedly".to_string(),
                )
                .await?;
            }
        }

        // Every attempted service must reach ready or error
        loop {
            let snapshot = require_stack(self.store(), account, &stack_id).await?;
            let settled = attempted
                .iter()
                .all(|key| snapshot.service(key).map_or(true, |s| s.status.is_terminal()));
            if settled {
                break;
            }
            events.wait_for_stack(account, &stack_id, self.config.poll_interval()).await;
        }

        let stack = state::update_stack(self.store(), account, &stack_id, |stack| {
            stack.status = stack.settled_status();
            Ok(true)
        })
        .await?;

        let outcome = if stack.status == StackStatus::Started { "started" } else { "error" };
        metrics::record_stack_start(outcome, started_at.elapsed().as_secs_f64());
        info!(status = %stack.status, "Stack {} settled", stack_id);

        self.get_stack_with_status(account, &stack_id).await
    }

    /// Realize the cluster services of every spec declaring ports.
    ///
    /// Existing services are reused. A failure marks the owning stack service
    /// as errored and skips it.
    async fn realize_services(
        &self,
        account: &str,
        stack: &Stack,
        specs: &BTreeMap<String, ServiceSpec>,
    ) -> Result<BTreeMap<String, ServiceAddress>> {
        let mut addresses = BTreeMap::new();
        for service in &stack.services {
            let Some(spec) = specs.get(&service.service) else {
                continue;
            };
            if spec.ports.is_empty() {
                continue;
            }

            match self.realize_service(account, &stack.id, spec).await {
                Ok(Some(address)) => {
                    addresses.insert(spec.key.clone(), address);
                }
                Ok(None) => {}
                Err(e) => {
                    error!(service = %spec.key, error = %e, "Error starting service");
                    self.fail_service(
                        account,
                        &stack.id,
                        &spec.key,
                        format!("Error starting service: {}", e),
                    )
                    .await?;
                }
            }
        }
        Ok(addresses)
    }

    async fn realize_service(
        &self,
        account: &str,
        stack_id: &str,
        spec: &ServiceSpec,
    ) -> Result<Option<ServiceAddress>> {
        let name = stack_service_id(stack_id, &spec.key);
        let object = match self.driver.get_service(account, &name).await? {
            Some(object) => object,
            None => {
                debug!("Starting cluster service {}", name);
                let object =
                    self.driver.create_service(account, &service_template(stack_id, spec)).await?;

                if spec.access == Access::External {
                    if let (Some(host), Some(port)) =
                        (self.config.ingress_host(&name), object.ports.first())
                    {
                        let ingress = IngressSpec {
                            name: name.clone(),
                            host: host.clone(),
                            service_name: object.name.clone(),
                            service_port: port.port,
                            tls_secret: Config::account_tls_secret(account),
                        };
                        self.driver.create_ingress(account, &ingress).await?;
                        debug!("Started ingress {} for service {}", host, object.name);
                    }
                }
                object
            }
        };
        Ok(ServiceAddress::from_object(&spec.key, &object))
    }

    /// Launch the controller of one stack service and wait until it leaves
    /// the pending states. Returns whether it became ready.
    async fn start_controller(&self, pass: &StartPass, key: &str) -> Result<bool> {
        let account = pass.account.as_str();
        let stack_id = pass.stack_id.as_str();
        let name = stack_service_id(stack_id, key);
        let Some(spec) = pass.specs.get(key) else {
            return Ok(false);
        };

        let pods = self.driver.list_pods(account, LABEL_NAME, &name).await?;
        if let Some(pod) = pods.iter().find(|p| p.phase == PodPhase::Running) {
            debug!("Controller {} already running", name);
            if pod_ready(pod) {
                self.set_service_status(account, stack_id, key, ServiceStatus::Ready).await?;
                return Ok(true);
            }
        } else {
            let snapshot = require_stack(self.store(), account, stack_id).await?;
            let Some(stack_service) = snapshot.service(key) else {
                return Ok(false);
            };

            let mut shared_env = BTreeMap::new();
            for dep in pass.graph.share_config_dependencies(key) {
                if let Some(dependency) = snapshot.service(&dep) {
                    shared_env.extend(dependency.config.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }

            let template = controller_template(&TemplateContext {
                account,
                stack_id,
                stack_service,
                spec,
                addresses: &pass.addresses,
                shared_env: &shared_env,
                vol_dir: &self.config.vol_dir,
                home_mount_path: &self.config.home_mount_path,
            });

            self.set_service_status(account, stack_id, key, ServiceStatus::Starting).await?;

            debug!("Starting controller {}", name);
            if let Err(e) = self.driver.create_controller(account, &template).await {
                metrics::record_controller_failure();
                error!(controller = %name, error = %e, "Error starting stack service");
                self.fail_service(
                    account,
                    stack_id,
                    key,
                    format!("Error starting stack service: {}", e),
                )
                .await?;
                return Err(e);
            }
            metrics::record_controller_created();
        }

        let mut events = self.subscribe();
        loop {
            let snapshot = require_stack(self.store(), account, stack_id).await?;
            let Some(status) = snapshot.service(key).map(|s| s.status) else {
                return Ok(false);
            };
            debug!(service = %name, status = %status, "Waiting for stack service");
            if !status.is_pending() {
                return Ok(status == ServiceStatus::Ready);
            }
            events.wait_for_stack(account, stack_id, self.config.poll_interval()).await;
        }
    }

    async fn set_service_status(
        &self,
        account: &str,
        stack_id: &str,
        key: &str,
        status: ServiceStatus,
    ) -> Result<()> {
        state::update_stack(self.store(), account, stack_id, |stack| {
            Ok(match stack.service_mut(key) {
                Some(service) if service.status != status => {
                    service.status = status;
                    true
                }
                _ => false,
            })
        })
        .await?;
        Ok(())
    }

    async fn fail_service(
        &self,
        account: &str,
        stack_id: &str,
        key: &str,
        message: String,
    ) -> Result<()> {
        state::update_stack(self.store(), account, stack_id, |stack| {
            Ok(match stack.service_mut(key) {
                Some(service) => {
                    service.status = ServiceStatus::Error;
                    service.push_message(message.clone());
                    true
                }
                None => false,
            })
        })
        .await?;
        Ok(())
    }

    /// Record the outcome of a finished controller task.
    ///
    /// A task that failed early leaves its service pending, so the service is
    /// marked errored here. Returns false when the task panicked and its
    /// service is unknown.
    async fn reap(
        &self,
        account: &str,
        stack_id: &str,
        joined: std::result::Result<(String, Result<bool>), JoinError>,
    ) -> Result<bool> {
        match joined {
            Ok((_, Ok(_))) => Ok(true),
            Ok((key, Err(e))) => {
                warn!(service = %key, error = %e, "Controller task failed");
                self.fail_pending(account, stack_id, &key, format!("Error starting stack service: {}", e))
                    .await?;
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "Controller task panicked");
                Ok(false)
            }
        }
    }

    /// Mark a service errored unless it already left the pending states.
    async fn fail_pending(
        &self,
        account: &str,
        stack_id: &str,
        key: &str,
        message: String,
    ) -> Result<()> {
        state::update_stack(self.store(), account, stack_id, |stack| {
            Ok(match stack.service_mut(key) {
                Some(service) if service.status.is_pending() => {
                    service.status = ServiceStatus::Error;
                    service.push_message(message.clone());
                    true
                }
                _ => false,
            })
        })
        .await?;
        Ok(())
    }

    // ========================
    // Stop
    // ========================

    /// Tear down a stack, dependents before their dependencies.
    ///
    /// No-op on a stopped stack. Individual deletion failures are logged and
    /// skipped.
    #[instrument(skip(self), fields(account = %account, stack_id = %stack_id))]
    pub async fn stop(&self, account: &str, stack_id: &str) -> Result<Stack> {
        let stack = state::update_stack(self.store(), account, stack_id, |stack| {
            if stack.status == StackStatus::Stopped {
                return Ok(false);
            }
            stack.status = StackStatus::Stopping;
            Ok(true)
        })
        .await?;

        if stack.status == StackStatus::Stopped {
            debug!("Stack {} already stopped", stack_id);
            return self.get_stack_with_status(account, stack_id).await;
        }

        info!("Stopping stack {}", stack_id);
        self.run_stop(account, stack).await
    }

    async fn run_stop(&self, account: &str, stack: Stack) -> Result<Stack> {
        let _in_flight = InFlight::enter();
        let stack_id = stack.id.clone();
        let mut events = self.subscribe();

        let mut specs = BTreeMap::new();
        for service in &stack.services {
            if let Some(spec) = self.store.get_service_spec(account, &service.service).await? {
                specs.insert(service.service.clone(), spec);
            }
        }
        let graph = DependencyGraph::for_members(specs.values());

        // Torn down services, mapped to whether their controller was deleted
        let mut torn_down: BTreeMap<String, bool> = BTreeMap::new();
        while torn_down.len() < stack.services.len() {
            let snapshot = require_stack(self.store(), account, &stack_id).await?;
            let mut progressed = false;

            for service in &snapshot.services {
                if torn_down.contains_key(&service.service) {
                    continue;
                }

                let mut blocked = false;
                for dependent in graph.dependents(&service.service) {
                    if !self.is_down(account, &snapshot, &torn_down, &dependent).await {
                        blocked = true;
                        break;
                    }
                }
                if blocked {
                    continue;
                }

                let deleted = self.teardown(account, service, specs.get(&service.service)).await;
                torn_down.insert(service.service.clone(), deleted);
                progressed = true;
            }

            if !progressed {
                events.wait_for_stack(account, &stack_id, self.config.poll_interval()).await;
            }
        }

        let phases = self.pod_phases(account, &stack_id).await;
        state::update_stack(self.store(), account, &stack_id, |stack| {
            for service in &mut stack.services {
                service.status = match phases.get(&service.service) {
                    Some(PodPhase::Failed) => ServiceStatus::Error,
                    _ => ServiceStatus::Stopped,
                };
                service.status_messages.clear();
                service.endpoints.clear();
                service.internal_ip = None;
            }
            stack.status = StackStatus::Stopped;
            Ok(true)
        })
        .await?;

        metrics::record_stack_stop();
        info!("Stack {} stopped", stack_id);
        self.get_stack_with_status(account, &stack_id).await
    }

    /// A dependent counts as down once it never started, reports stopped, or
    /// was torn down in this pass. Pods are only waited for when the
    /// controller delete went through; a failed delete leaves them behind.
    async fn is_down(
        &self,
        account: &str,
        snapshot: &Stack,
        torn_down: &BTreeMap<String, bool>,
        key: &str,
    ) -> bool {
        match snapshot.service(key) {
            None => true,
            Some(service) if service.status.is_down() => true,
            Some(_) if torn_down.get(key) == Some(&false) => true,
            Some(service) if torn_down.contains_key(key) => {
                match self.driver.list_pods(account, LABEL_NAME, &service.id).await {
                    Ok(pods) => pods.is_empty(),
                    Err(e) => {
                        warn!(service = %service.id, error = %e, "Error listing pods");
                        true
                    }
                }
            }
            Some(_) => false,
        }
    }

    /// Delete the cluster objects of a service. Returns whether the
    /// controller delete succeeded.
    async fn teardown(&self, account: &str, service: &StackService, spec: Option<&ServiceSpec>) -> bool {
        let name = service.id.as_str();
        debug!("Stopping service {}", name);

        if spec.map_or(false, |s| !s.ports.is_empty()) {
            if let Err(e) = self.driver.delete_service(account, name).await {
                metrics::record_teardown_failure("service");
                error!(service = %name, error = %e, "Error deleting service");
            }
        }
        if self.config.uses_ingress() {
            if let Err(e) = self.driver.delete_ingress(account, name).await {
                metrics::record_teardown_failure("ingress");
                error!(service = %name, error = %e, "Error deleting ingress");
            }
        }
        match self.driver.delete_controller(account, name).await {
            Ok(()) => true,
            Err(e) => {
                metrics::record_teardown_failure("controller");
                error!(controller = %name, error = %e, "Error deleting controller");
                false
            }
        }
    }

    /// Phase of the remaining pods of a stack, by catalog key.
    async fn pod_phases(&self, account: &str, stack_id: &str) -> BTreeMap<String, PodPhase> {
        let pods = match self.driver.list_pods(account, LABEL_STACK, stack_id).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Error listing pods of stack {}", stack_id);
                return BTreeMap::new();
            }
        };
        pods.into_iter()
            .filter(|pod| !pod.conditions.is_empty())
            .filter_map(|pod| pod.label(LABEL_SERVICE).map(|key| (key.to_string(), pod.phase)))
            .collect()
    }

    // ========================
    // Queries
    // ========================

    /// Persisted stack decorated with live endpoints from the cluster.
    pub async fn get_stack_with_status(&self, account: &str, stack_id: &str) -> Result<Stack> {
        let stack = require_stack(self.store(), account, stack_id).await?;
        self.decorate(account, stack).await
    }

    async fn decorate(&self, account: &str, mut stack: Stack) -> Result<Stack> {
        for service in &mut stack.services {
            service.endpoints.clear();

            let Some(object) = self.driver.get_service(account, &service.id).await? else {
                continue;
            };
            let Some(spec) = self.store.get_service_spec(account, &service.service).await? else {
                warn!(service = %service.service, "Service spec not found");
                continue;
            };

            service.internal_ip = Some(object.cluster_ip.clone());
            for port in &spec.ports {
                if let Some(status) = object.port(port.port) {
                    let host = if spec.access == Access::External {
                        self.config.ingress_host(&service.id)
                    } else {
                        None
                    };
                    service.endpoints.push(Endpoint {
                        port: port.port,
                        protocol: port.protocol,
                        node_port: status.node_port,
                        host,
                    });
                }
            }
        }
        Ok(stack)
    }

    /// Every stack of the account with live status.
    pub async fn list_stacks(&self, account: &str) -> Result<Vec<Stack>> {
        let mut stacks = Vec::new();
        for stack in self.store.list_stacks(account).await? {
            stacks.push(self.decorate(account, stack).await?);
        }
        Ok(stacks)
    }

    /// Status messages of a stack service followed by the tail of its pod log.
    #[instrument(skip(self), fields(account = %account))]
    pub async fn get_logs(
        &self,
        account: &str,
        stack_service_id: &str,
        tail_lines: Option<usize>,
    ) -> Result<String> {
        let not_found =
            || StrataError::StackServiceNotFound { stack_service_id: stack_service_id.to_string() };
        let stack_id = stack_id_of(stack_service_id).ok_or_else(not_found)?;
        let stack = match self.store.get_stack(account, stack_id).await? {
            Some(stack) => stack,
            None => return Err(not_found()),
        };
        let service =
            stack.services.iter().find(|s| s.id == stack_service_id).ok_or_else(not_found)?;

        let mut log = String::from("KUBERNETES LOG\n=====================\n");
        for message in &service.status_messages {
            log.push_str(message);
            log.push('\n');
        }

        log.push_str("\nSERVICE LOG\n=====================\n");
        let pods = self.driver.list_pods(account, LABEL_NAME, stack_service_id).await?;
        if let Some(pod) = pods.first() {
            log.push_str(&self.driver.get_log(account, &pod.name, tail_lines).await?);
        }
        Ok(log)
    }

    // ========================
    // Stack records
    // ========================

    /// Store a new stack in the stopped state.
    ///
    /// Assigns a fresh id, derives service ids, resolves configuration and
    /// allocates scratch volumes for unmapped declared mounts.
    #[instrument(skip(self, stack), fields(account = %account, key = %stack.key))]
    pub async fn create_stack(&self, account: &str, mut stack: Stack) -> Result<Stack> {
        if self.store.get_service_spec(account, &stack.key).await?.is_none() {
            debug!("Service {} not found for account {}", stack.key, account);
            return Err(StrataError::ServiceNotFound { key: stack.key.clone() });
        }

        stack.id = self.fresh_stack_id(account).await?;
        stack.status = StackStatus::Stopped;
        stack.revision = 0;
        stack.created_at = chrono::Utc::now();
        stack.updated_at = None;
        self.prepare_services(account, &mut stack).await?;

        stack.revision = self.store.put_stack(account, &stack).await?;
        info!(stack_id = %stack.id, "Added stack {} {}", stack.key, stack.name);
        Ok(stack)
    }

    /// Replace the definition of a stopped stack.
    #[instrument(skip(self, stack), fields(account = %account, stack_id = %stack_id))]
    pub async fn update_stack(&self, account: &str, stack_id: &str, mut stack: Stack) -> Result<Stack> {
        let existing = require_stack(self.store(), account, stack_id).await?;
        if existing.status != StackStatus::Stopped {
            return Err(StrataError::InvalidStackState {
                stack_id: stack_id.to_string(),
                status: existing.status.to_string(),
                expected: StackStatus::Stopped.to_string(),
            });
        }

        stack.id = stack_id.to_string();
        stack.status = StackStatus::Stopped;
        stack.revision = existing.revision;
        stack.created_at = existing.created_at;
        stack.updated_at = Some(chrono::Utc::now());
        self.prepare_services(account, &mut stack).await?;

        match self.store.compare_and_put_stack(account, &stack).await? {
            state::CasOutcome::Stored(revision) => {
                stack.revision = revision;
                Ok(stack)
            }
            state::CasOutcome::Conflict(_) => Err(StrataError::WriteConflict {
                key: state::keys::stack(account, stack_id),
                attempts: 1,
            }),
            state::CasOutcome::Missing => Err(StrataError::StackNotFound {
                account: account.to_string(),
                stack_id: stack_id.to_string(),
            }),
        }
    }

    /// Remove a stack record. Refused while the stack is starting or started.
    #[instrument(skip(self), fields(account = %account, stack_id = %stack_id))]
    pub async fn delete_stack(&self, account: &str, stack_id: &str) -> Result<()> {
        let stack = require_stack(self.store(), account, stack_id).await?;
        if matches!(stack.status, StackStatus::Started | StackStatus::Starting) {
            return Err(StrataError::InvalidStackState {
                stack_id: stack_id.to_string(),
                status: stack.status.to_string(),
                expected: StackStatus::Stopped.to_string(),
            });
        }
        self.store.delete_stack(account, stack_id).await?;
        info!("Deleted stack {}", stack_id);
        Ok(())
    }

    async fn fresh_stack_id(&self, account: &str) -> Result<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = self.driver.generate_name(STACK_ID_LEN);
            if self.store.get_stack(account, &id).await?.is_none() {
                return Ok(id);
            }
        }
        Err(StrataError::Internal("Could not generate a unique stack id".to_string()))
    }

    async fn prepare_services(&self, account: &str, stack: &mut Stack) -> Result<()> {
        for service in &mut stack.services {
            let spec = self
                .store
                .get_service_spec(account, &service.service)
                .await?
                .ok_or_else(|| StrataError::ServiceNotFound { key: service.service.clone() })?;

            service.id = stack_service_id(&stack.id, &service.service);
            service.status = ServiceStatus::Unset;
            service.endpoints.clear();
            service.internal_ip = None;
            service.config = spec.resolve_config(&service.config)?;
            service.volume_mounts =
                volumes::allocate(&spec.volume_mounts, &service.volume_mounts, || {
                    self.driver.random_suffix(SUFFIX_LEN)
                })?;
        }
        Ok(())
    }
}

/// True when the pod reports the Ready condition.
fn pod_ready(pod: &PodState) -> bool {
    pod.conditions.first().map_or(false, |c| c.condition_type == "Ready" && c.status)
}
