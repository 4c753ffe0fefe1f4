//! Instance lifecycle orchestration

use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::credentials;
use super::inflight::InFlight;
use super::state::{self, TransitionEvent};
use crate::config::ProvisioningConfig;
use crate::container::{
    container_name, ContainerHandle, ContainerSpec, DriverRegistry, RemoteContainerDriver,
};
use crate::error::{ProvisionError, Result};
use crate::metrics;
use crate::models::{
    CreateOutcome, CreatedInstance, Engine, InstanceDetails, InstanceEvent, InstanceEventKind,
    InstanceRecord, InstanceStatus, ProvisioningRequest,
};
use crate::notify::Notifier;
use crate::persistence::InstanceRepository;

const MAX_DISPLAY_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy)]
enum RemoteAction {
    Start,
    Stop,
    Remove,
}

impl RemoteAction {
    /// Action that undoes this one, if any
    fn inverse(self) -> Option<RemoteAction> {
        match self {
            RemoteAction::Start => Some(RemoteAction::Stop),
            RemoteAction::Stop => Some(RemoteAction::Start),
            RemoteAction::Remove => None,
        }
    }
}

/// Drives instances through their lifecycle
///
/// Records are read from and written back to the repository on every call;
/// nothing is cached. Operations on one instance id are serialized by the
/// in-flight registry, operations on different ids run in parallel.
pub struct InstanceLifecycleManager {
    repository: Arc<dyn InstanceRepository>,
    notifier: Arc<dyn Notifier>,
    drivers: Arc<DriverRegistry>,
    placement_host: String,
    provisioning: ProvisioningConfig,
    inflight: InFlight,
}

impl InstanceLifecycleManager {
    pub fn new(
        repository: Arc<dyn InstanceRepository>,
        notifier: Arc<dyn Notifier>,
        drivers: Arc<DriverRegistry>,
        placement_host: impl Into<String>,
        provisioning: ProvisioningConfig,
    ) -> Self {
        Self {
            repository,
            notifier,
            drivers,
            placement_host: placement_host.into(),
            provisioning,
            inflight: InFlight::new(),
        }
    }

    /// Deadline applied when the caller does not supply one
    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.provisioning.operation_deadline()
    }

    fn cleanup_deadline(&self) -> Instant {
        Instant::now() + self.provisioning.command_timeout()
    }

    pub async fn create(&self, request: ProvisioningRequest) -> Result<CreateOutcome> {
        self.create_within(request, self.default_deadline()).await
    }

    /// Provision a new instance, or report the one a previous request with the same id created
    pub async fn create_within(
        &self,
        request: ProvisioningRequest,
        deadline: Instant,
    ) -> Result<CreateOutcome> {
        let engine = validate_request(&request)?;
        let id = request.instance_id;
        let _guard = self.inflight.begin(id)?;

        let existing = match self.repository.load_instance(id).await? {
            None => return self.provision(&request, engine, None, deadline).await,
            Some(existing) => existing,
        };
        if existing.status == InstanceStatus::Deleted {
            return Err(ProvisionError::IllegalTransition {
                instance_id: id,
                from: InstanceStatus::Deleted,
                event: TransitionEvent::CreateRequested,
            });
        }
        ensure_same_instance(&request, engine, &existing)?;

        if existing.status == InstanceStatus::Creating {
            warn!(instance_id = %id, host = %existing.host, "Resuming interrupted creation");
            return self
                .provision(&request, engine, Some(existing), deadline)
                .await;
        }
        info!(instance_id = %id, status = %existing.status, "Instance already provisioned");
        Ok(CreateOutcome::AlreadyProvisioned((&existing).into()))
    }

    async fn provision(
        &self,
        request: &ProvisioningRequest,
        engine: Engine,
        interrupted: Option<InstanceRecord>,
        deadline: Instant,
    ) -> Result<CreateOutcome> {
        let id = request.instance_id;
        let name = match &interrupted {
            Some(previous) => previous.container_name.clone(),
            None => container_name(engine, id),
        };

        // An interrupted creation keeps its host and port; a new one gets a lease
        let (driver, port, lease, created_at) = match &interrupted {
            Some(previous) => match self.drivers.get(&previous.host) {
                Ok(driver) => (driver, previous.port, None, previous.created_at),
                Err(e) => return Err(self.record_failed_creation(previous.clone(), e).await),
            },
            None => {
                let driver = self.drivers.get(&self.placement_host)?;
                let lease = driver.allocate_port(self.repository.as_ref()).await?;
                (driver, lease.port(), Some(lease), Utc::now())
            }
        };

        let credential = credentials::generate(engine, driver.address(), port);
        let credential_hash = match credentials::hash_password(&credential.password) {
            Ok(hash) => hash,
            Err(e) => {
                return Err(match &interrupted {
                    Some(previous) => self.record_failed_creation(previous.clone(), e).await,
                    None => e,
                })
            }
        };

        let status = state::transition(None, TransitionEvent::CreateRequested)
            .unwrap_or(InstanceStatus::Creating);
        let record = InstanceRecord {
            id,
            user_id: request.user_id.clone(),
            subscription_id: request.subscription_id.clone(),
            engine,
            display_name: display_name(request, engine),
            container_name: name.clone(),
            host: driver.host().to_string(),
            port,
            status,
            db_username: credential.username.clone(),
            db_name: credential.database.clone(),
            credential_hash,
            last_error: None,
            created_at,
            updated_at: Utc::now(),
        };

        self.repository.save_instance(&record).await?;
        // The persisted record now holds the port
        drop(lease);
        metrics::record_transition(TransitionEvent::CreateRequested.as_str(), "ok");
        info!(instance_id = %id, host = %record.host, container = %name, port, "Instance creating");

        let handle = ContainerHandle::named(name.clone());
        let remote = async {
            if interrupted.is_some() {
                driver.remove_container(&handle, deadline).await?;
            }
            let spec = ContainerSpec {
                instance_id: id,
                name: name.clone(),
                engine,
                image: self.provisioning.image_for(engine),
                host_port: port,
                credential: &credential,
            };
            let handle = driver.create_container(&spec, deadline).await?;
            driver.start_container(&handle, deadline).await
        };

        if let Err(e) = remote.await {
            return Err(self.fail_creation(&driver, record, e).await);
        }

        let running = InstanceRecord {
            last_error: None,
            ..record.with_status(state::validate(id, record.status, TransitionEvent::ContainerStarted)?)
        };
        if let Err(e) = self.repository.save_instance(&running).await {
            return Err(self.fail_creation(&driver, record, e.into()).await);
        }

        metrics::record_transition(TransitionEvent::ContainerStarted.as_str(), "ok");
        info!(instance_id = %id, host = %running.host, container = %name, "Instance running");
        self.notifier
            .emit(InstanceEvent::new(InstanceEventKind::Created, &running));

        let connection_uri = credential.connection_uri(engine);
        Ok(CreateOutcome::Created(CreatedInstance {
            instance: (&running).into(),
            credential,
            connection_uri,
        }))
    }

    /// Record a failed creation as DELETED and clean up what was created remotely
    async fn fail_creation(
        &self,
        driver: &RemoteContainerDriver,
        record: InstanceRecord,
        cause: ProvisionError,
    ) -> ProvisionError {
        let handle = ContainerHandle::named(record.container_name.clone());
        if let Err(e) = driver.remove_container(&handle, self.cleanup_deadline()).await {
            warn!(instance_id = %record.id, container = %handle.name, error = %e, "Cleanup of failed container failed");
        }
        self.record_failed_creation(record, cause).await
    }

    /// Persist a CREATING record as DELETED with the failure that ended it
    ///
    /// Used directly when the host cannot be reached through a driver, so no
    /// remote cleanup is attempted.
    async fn record_failed_creation(
        &self,
        record: InstanceRecord,
        cause: ProvisionError,
    ) -> ProvisionError {
        warn!(instance_id = %record.id, host = %record.host, error = %cause, "Instance creation failed");

        let next = state::transition(Some(record.status), TransitionEvent::ProvisioningFailed)
            .unwrap_or(InstanceStatus::Deleted);
        let failed = InstanceRecord {
            last_error: Some(cause.to_string()),
            ..record.with_status(next)
        };
        if let Err(e) = self.repository.save_instance(&failed).await {
            error!(instance_id = %record.id, error = %e, "Failed to persist failed creation");
        }

        metrics::record_transition(TransitionEvent::ProvisioningFailed.as_str(), "ok");
        self.notifier.emit(
            InstanceEvent::new(InstanceEventKind::CreateFailed, &failed).with_message(cause.to_string()),
        );
        cause
    }

    pub async fn suspend(&self, id: Uuid) -> Result<InstanceDetails> {
        self.suspend_within(id, self.default_deadline()).await
    }

    pub async fn suspend_within(&self, id: Uuid, deadline: Instant) -> Result<InstanceDetails> {
        self.apply_transition(id, TransitionEvent::SuspendRequested, deadline)
            .await
    }

    pub async fn resume(&self, id: Uuid) -> Result<InstanceDetails> {
        self.resume_within(id, self.default_deadline()).await
    }

    pub async fn resume_within(&self, id: Uuid, deadline: Instant) -> Result<InstanceDetails> {
        self.apply_transition(id, TransitionEvent::ResumeRequested, deadline)
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<InstanceDetails> {
        self.delete_within(id, self.default_deadline()).await
    }

    pub async fn delete_within(&self, id: Uuid, deadline: Instant) -> Result<InstanceDetails> {
        self.apply_transition(id, TransitionEvent::DeleteRequested, deadline)
            .await
    }

    /// Current view of an instance; never includes a password
    pub async fn get(&self, id: Uuid) -> Result<InstanceDetails> {
        Ok((&self.load(id).await?).into())
    }

    pub async fn list(&self) -> Result<Vec<InstanceDetails>> {
        Ok(self
            .repository
            .list_instances()
            .await?
            .iter()
            .map(InstanceDetails::from)
            .collect())
    }

    async fn load(&self, id: Uuid) -> Result<InstanceRecord> {
        self.repository
            .load_instance(id)
            .await?
            .ok_or(ProvisionError::NotFound(id))
    }

    async fn apply_transition(
        &self,
        id: Uuid,
        event: TransitionEvent,
        deadline: Instant,
    ) -> Result<InstanceDetails> {
        let _guard = self.inflight.begin(id)?;
        let record = self.load(id).await?;
        let next = state::validate(id, record.status, event).map_err(|e| {
            metrics::record_transition(event.as_str(), "rejected");
            e
        })?;

        let (action, kind) = match event {
            TransitionEvent::SuspendRequested => (RemoteAction::Stop, InstanceEventKind::Suspended),
            TransitionEvent::ResumeRequested => (RemoteAction::Start, InstanceEventKind::Resumed),
            TransitionEvent::DeleteRequested => (RemoteAction::Remove, InstanceEventKind::Deleted),
            other => {
                return Err(ProvisionError::IllegalTransition {
                    instance_id: id,
                    from: record.status,
                    event: other,
                })
            }
        };

        let driver = self.drivers.get(&record.host)?;
        let handle = ContainerHandle::named(record.container_name.clone());

        if let Err(e) = run_action(&driver, action, &handle, deadline).await {
            warn!(instance_id = %id, event = %event, error = %e, "Transition failed, status unchanged");
            metrics::record_transition(event.as_str(), "failed");

            let failed = InstanceRecord {
                last_error: Some(e.to_string()),
                updated_at: Utc::now(),
                ..record.clone()
            };
            if let Err(save_err) = self.repository.save_instance(&failed).await {
                warn!(instance_id = %id, error = %save_err, "Failed to record transition error");
            }
            self.notifier.emit(
                InstanceEvent::new(InstanceEventKind::TransitionFailed, &record)
                    .with_message(format!("{}: {}", event, e)),
            );
            return Err(e);
        }

        let updated = InstanceRecord {
            last_error: None,
            ..record.with_status(next)
        };
        if let Err(e) = self.repository.save_instance(&updated).await {
            error!(instance_id = %id, event = %event, error = %e, "Failed to persist transition");
            metrics::record_transition(event.as_str(), "failed");
            if let Some(undo) = action.inverse() {
                match run_action(&driver, undo, &handle, self.cleanup_deadline()).await {
                    Ok(()) => info!(instance_id = %id, "Remote action compensated"),
                    Err(ce) => {
                        error!(instance_id = %id, error = %ce, "Compensation failed, container and record disagree")
                    }
                }
            }
            return Err(e.into());
        }

        metrics::record_transition(event.as_str(), "ok");
        info!(instance_id = %id, event = %event, status = %updated.status, "Transition complete");
        self.notifier.emit(InstanceEvent::new(kind, &updated));
        Ok((&updated).into())
    }
}

async fn run_action(
    driver: &RemoteContainerDriver,
    action: RemoteAction,
    handle: &ContainerHandle,
    deadline: Instant,
) -> Result<()> {
    match action {
        RemoteAction::Start => driver.start_container(handle, deadline).await,
        RemoteAction::Stop => driver.stop_container(handle, deadline).await,
        RemoteAction::Remove => driver.remove_container(handle, deadline).await,
    }
}

fn validate_request(request: &ProvisioningRequest) -> Result<Engine> {
    if request.user_id.trim().is_empty() {
        return Err(ProvisionError::InvalidRequest("user_id is required".to_string()));
    }
    if request.subscription_id.trim().is_empty() {
        return Err(ProvisionError::InvalidRequest(
            "subscription_id is required".to_string(),
        ));
    }
    if let Some(name) = &request.custom_name {
        let valid_chars = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ' ' | '.'));
        if name.trim().is_empty() || name.len() > MAX_DISPLAY_NAME_LEN || !valid_chars {
            return Err(ProvisionError::InvalidRequest(format!(
                "invalid instance name: {:?}",
                name
            )));
        }
    }
    request
        .engine
        .parse::<Engine>()
        .map_err(ProvisionError::InvalidRequest)
}

/// A repeated create must describe the instance already stored under its id
fn ensure_same_instance(
    request: &ProvisioningRequest,
    engine: Engine,
    existing: &InstanceRecord,
) -> Result<()> {
    let field = if existing.engine != engine {
        "engine"
    } else if existing.user_id != request.user_id {
        "user_id"
    } else if existing.subscription_id != request.subscription_id {
        "subscription_id"
    } else {
        return Ok(());
    };
    Err(ProvisionError::InvalidRequest(format!(
        "instance {} already exists with a different {}",
        existing.id, field
    )))
}

fn display_name(request: &ProvisioningRequest, engine: Engine) -> String {
    match &request.custom_name {
        Some(name) => name.trim().to_string(),
        None => {
            let id = request.instance_id.simple().to_string();
            format!("{}-{}", engine, &id[..8])
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::notify::MockNotifier;
    use crate::test_support::{harness, harness_with, request};

    fn created(outcome: CreateOutcome) -> CreatedInstance {
        match outcome {
            CreateOutcome::Created(created) => created,
            other => panic!("expected a new instance, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_discloses_password_once() {
        let (h, events) = harness();

        let created = created(h.manager.create(request("postgres")).await.unwrap());
        let id = created.instance.id;

        assert_eq!(created.instance.status, InstanceStatus::Running);
        assert_eq!(created.credential.password.len(), 24);
        assert!(created.connection_uri.contains(&created.credential.password));
        assert!(h.fake.is_running(&created.instance.container_name));

        let record = h.store.load_instance(id).await.unwrap().unwrap();
        assert!(credentials::verify_password(&created.credential.password, &record.credential_hash));
        assert!(!record.credential_hash.contains(&created.credential.password));

        let fetched = h.manager.get(id).await.unwrap();
        let json = serde_json::to_string(&fetched).unwrap();
        assert!(!json.contains(&created.credential.password));
        assert!(!json.contains("password"));
        assert!(!format!("{:?}", created.credential).contains(&created.credential.password));

        let kinds: Vec<_> = events.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![InstanceEventKind::Created]);
    }

    #[tokio::test]
    async fn test_create_twice_yields_one_instance() {
        let (h, _) = harness();
        let req = request("mysql");

        let first = created(h.manager.create(req.clone()).await.unwrap());
        let second = h.manager.create(req.clone()).await.unwrap();

        match second {
            CreateOutcome::AlreadyProvisioned(details) => {
                assert_eq!(details.id, first.instance.id);
                assert_eq!(details.port, first.instance.port);
                assert_eq!(details.status, InstanceStatus::Running);
            }
            other => panic!("expected AlreadyProvisioned, got {other:?}"),
        }
        assert_eq!(h.fake.container_count(), 1);
        assert_eq!(h.store.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_creates_get_distinct_ports() {
        let (h, _) = harness();

        let (a, b) = tokio::join!(
            h.manager.create(request("postgres")),
            h.manager.create(request("redis"))
        );
        let (a, b) = (created(a.unwrap()), created(b.unwrap()));

        assert_ne!(a.instance.port, b.instance.port);
        assert_eq!(h.fake.container_count(), 2);
        assert_eq!(b.credential.username, "default");
    }

    #[tokio::test]
    async fn test_deleted_instance_rejects_transitions() {
        let (h, _) = harness();
        let id = created(h.manager.create(request("postgres")).await.unwrap()).instance.id;
        h.manager.delete(id).await.unwrap();
        let before = h.store.load_instance(id).await.unwrap().unwrap();

        let err = h.manager.resume(id).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::IllegalTransition { from: InstanceStatus::Deleted, event: TransitionEvent::ResumeRequested, .. }
        ));
        assert!(matches!(
            h.manager.suspend(id).await,
            Err(ProvisionError::IllegalTransition { .. })
        ));

        let mut retry = request("postgres");
        retry.instance_id = id;
        assert!(matches!(
            h.manager.create(retry).await,
            Err(ProvisionError::IllegalTransition { .. })
        ));

        let after = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_suspend_resume_delete_cycle() {
        let (h, events) = harness();
        let instance = created(h.manager.create(request("postgres")).await.unwrap()).instance;

        let suspended = h.manager.suspend(instance.id).await.unwrap();
        assert_eq!(suspended.status, InstanceStatus::Suspended);
        assert!(!h.fake.is_running(&instance.container_name));

        let resumed = h.manager.resume(instance.id).await.unwrap();
        assert_eq!(resumed.status, InstanceStatus::Running);
        assert!(h.fake.is_running(&instance.container_name));

        let deleted = h.manager.delete(instance.id).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleted);
        assert_eq!(h.fake.container_count(), 0);
        assert!(!h.store.is_port_in_use("db-1", instance.port).await.unwrap());

        let kinds: Vec<_> = events.events().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                InstanceEventKind::Created,
                InstanceEventKind::Suspended,
                InstanceEventKind::Resumed,
                InstanceEventKind::Deleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_transitions_conflict() {
        let (h, _) = harness();
        let id = created(h.manager.create(request("postgres")).await.unwrap()).instance.id;
        h.fake.set_exec_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(h.manager.suspend(id), h.manager.suspend(id));

        let (ok, conflict) = if a.is_ok() { (a, b) } else { (b, a) };
        assert_eq!(ok.unwrap().status, InstanceStatus::Suspended);
        assert!(matches!(conflict, Err(ProvisionError::ConflictingOperation(c)) if c == id));
    }

    #[tokio::test]
    async fn test_failed_create_is_recorded_as_deleted() {
        let (h, events) = harness();
        h.fake.set_fail_start(true);
        let req = request("postgres");

        let err = h.manager.create(req.clone()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Provisioning(_)));

        let record = h.store.load_instance(req.instance_id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Deleted);
        assert!(record.last_error.unwrap().contains("port is already allocated"));
        assert_eq!(h.fake.container_count(), 0);
        assert!(!h.store.is_port_in_use("db-1", record.port).await.unwrap());
        assert_eq!(events.events()[0].kind, InstanceEventKind::CreateFailed);
    }

    #[tokio::test]
    async fn test_expired_deadline_never_leaves_creating() {
        let (h, _) = harness();
        let req = request("mariadb");

        let err = h
            .manager
            .create_within(req.clone(), Instant::now())
            .await
            .unwrap_err();
        assert!(err.is_transport());

        let record = h.store.load_instance(req.instance_id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Deleted);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_interrupted_creation_is_resumed() {
        let (h, _) = harness();
        let req = request("postgres");

        // Simulate a crash after the CREATING record and container were written
        let mut stale = crate::test_support::sample_record("db-1", 20042, InstanceStatus::Creating);
        stale.id = req.instance_id;
        stale.container_name = container_name(Engine::Postgres, req.instance_id);
        h.store.save_instance(&stale).await.unwrap();
        h.fake.seed_container(&stale.container_name, false);

        let created = created(h.manager.create(req.clone()).await.unwrap());

        assert_eq!(created.instance.port, 20042);
        assert_eq!(created.instance.status, InstanceStatus::Running);
        assert_eq!(h.fake.container_count(), 1);
        assert!(h.fake.is_running(&stale.container_name));
        let record = h.store.load_instance(req.instance_id).await.unwrap().unwrap();
        assert_ne!(record.credential_hash, stale.credential_hash);
    }

    #[tokio::test]
    async fn test_retry_with_different_engine_is_rejected() {
        let (h, _) = harness();
        let req = request("postgres");

        let mut stale = crate::test_support::sample_record("db-1", 20042, InstanceStatus::Creating);
        stale.id = req.instance_id;
        stale.engine = Engine::Mysql;
        stale.container_name = container_name(Engine::Mysql, req.instance_id);
        h.store.save_instance(&stale).await.unwrap();
        h.fake.seed_container(&stale.container_name, false);

        let err = h.manager.create(req.clone()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidRequest(ref m) if m.contains("engine")));

        assert_eq!(h.fake.container_count(), 1);
        let record = h.store.load_instance(req.instance_id).await.unwrap().unwrap();
        assert_eq!(record, stale);
    }

    #[tokio::test]
    async fn test_retry_by_other_owner_is_rejected() {
        let (h, _) = harness();
        let req = request("redis");
        created(h.manager.create(req.clone()).await.unwrap());

        let mut other_user = req.clone();
        other_user.user_id = "user-2".to_string();
        assert!(matches!(
            h.manager.create(other_user).await,
            Err(ProvisionError::InvalidRequest(m)) if m.contains("user_id")
        ));

        let mut other_subscription = req.clone();
        other_subscription.subscription_id = "sub-2".to_string();
        assert!(matches!(
            h.manager.create(other_subscription).await,
            Err(ProvisionError::InvalidRequest(m)) if m.contains("subscription_id")
        ));
        assert_eq!(h.fake.container_count(), 1);
    }

    #[tokio::test]
    async fn test_interrupted_creation_on_unknown_host_is_recorded() {
        let (h, events) = harness();
        let req = request("postgres");

        let mut stale = crate::test_support::sample_record("db-gone", 20042, InstanceStatus::Creating);
        stale.id = req.instance_id;
        h.store.save_instance(&stale).await.unwrap();

        let err = h.manager.create(req.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Remote(crate::error::RemoteError::UnknownHost(ref host)) if host == "db-gone"
        ));

        let record = h.store.load_instance(req.instance_id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Deleted);
        assert!(record.last_error.unwrap().contains("db-gone"));
        assert_eq!(events.events()[0].kind, InstanceEventKind::CreateFailed);

        // A later retry sees a finished instance, not a stuck one
        assert!(matches!(
            h.manager.create(req).await,
            Err(ProvisionError::IllegalTransition { from: InstanceStatus::Deleted, .. })
        ));
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_prior_status() {
        let (h, events) = harness();
        let id = created(h.manager.create(request("postgres")).await.unwrap()).instance.id;
        h.fake.fail_next_execs(2);

        let err = h.manager.suspend(id).await.unwrap_err();
        assert!(err.is_transport());

        let record = h.store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
        assert!(record.last_error.is_some());
        assert_eq!(
            events.events().last().map(|e| e.kind),
            Some(InstanceEventKind::TransitionFailed)
        );
    }

    #[tokio::test]
    async fn test_persist_failure_compensates_remote_action() {
        let (h, _) = harness();
        let instance = created(h.manager.create(request("postgres")).await.unwrap()).instance;
        h.store.set_fail_saves(true);

        let err = h.manager.suspend(instance.id).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Persistence(_)));

        // Stopped, then started again
        assert!(h.fake.is_running(&instance.container_name));
        let record = h.store.load_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_invalid_requests_touch_nothing() {
        let (h, _) = harness();

        let err = h.manager.create(request("oracle")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidRequest(_)));

        let mut bad_name = request("postgres");
        bad_name.custom_name = Some("x; rm -rf /".to_string());
        assert!(matches!(
            h.manager.create(bad_name).await,
            Err(ProvisionError::InvalidRequest(_))
        ));

        assert!(h.store.list_instances().await.unwrap().is_empty());
        assert_eq!(h.fake.connects(), 0);
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let (h, _) = harness();
        let id = Uuid::new_v4();
        assert!(matches!(h.manager.get(id).await, Err(ProvisionError::NotFound(_))));
        assert!(matches!(h.manager.delete(id).await, Err(ProvisionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_events_reach_notifier() {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_emit()
            .withf(|e| e.kind == InstanceEventKind::Created && e.status == InstanceStatus::Running)
            .times(1)
            .return_const(());
        notifier
            .expect_emit()
            .withf(|e| e.kind == InstanceEventKind::Suspended)
            .times(1)
            .return_const(());
        let h = harness_with(Arc::new(notifier));

        let mut req = request("mongodb");
        req.custom_name = Some("analytics".to_string());
        let created = created(h.manager.create(req).await.unwrap());
        assert_eq!(created.instance.display_name, "analytics");
        assert!(created.connection_uri.ends_with("?authSource=admin"));

        h.manager.suspend(created.instance.id).await.unwrap();
    }
}
