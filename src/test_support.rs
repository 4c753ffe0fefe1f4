//! Scripted in-memory docker host used by unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use uuid::Uuid;

use crate::config::{ProvisioningConfig, RemoteHostConfig};
use crate::container::DriverRegistry;
use crate::lifecycle::InstanceLifecycleManager;
use crate::models::{
    CommandResult, Engine, InstanceEvent, InstanceRecord, InstanceStatus, ProvisioningRequest,
    StatsSnapshot,
};
use crate::notify::Notifier;
use crate::persistence::MemoryInstanceStore;
use crate::remote::{Connector, PoolRegistry, Transport, TransportError};

pub fn host_config(name: &str) -> RemoteHostConfig {
    let mut host = RemoteHostConfig::new(name, "10.0.0.1", "deploy");
    host.password = Some("hunter2".to_string());
    host.connect_timeout_secs = 1;
    host.acquire_timeout_secs = 1;
    host
}

pub fn sample_record(host: &str, port: u16, status: InstanceStatus) -> InstanceRecord {
    let id = Uuid::new_v4();
    let now = Utc::now();
    InstanceRecord {
        id,
        user_id: "user-1".to_string(),
        subscription_id: "sub-1".to_string(),
        engine: Engine::Postgres,
        display_name: "orders".to_string(),
        container_name: crate::container::container_name(Engine::Postgres, id),
        host: host.to_string(),
        port,
        status,
        db_username: "app_test".to_string(),
        db_name: "main".to_string(),
        credential_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
        last_error: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_stats(instance_id: Uuid) -> StatsSnapshot {
    StatsSnapshot {
        instance_id,
        container_name: "dbaas-postgres-test".to_string(),
        cpu_percent: 1.5,
        memory_used_mb: 42.0,
        memory_limit_mb: 1024.0,
        memory_percent: 4.1,
        net_rx_mb: 0.5,
        net_tx_mb: 0.25,
        block_read_mb: 3.0,
        block_write_mb: 1.0,
        pids: 7,
        collected_at: Utc::now(),
    }
}

pub fn request(engine: &str) -> ProvisioningRequest {
    ProvisioningRequest {
        instance_id: Uuid::new_v4(),
        user_id: "user-1".to_string(),
        subscription_id: "sub-1".to_string(),
        engine: engine.to_string(),
        custom_name: None,
    }
}

/// Split a POSIX shell line into words (single quotes and backslashes only)
pub fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == '\'' {
                        break;
                    }
                    current.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    executed: Vec<Vec<String>>,
    exec_delay: Duration,
    connect_delay: Duration,
    next_id: u64,
}

/// A docker host reachable through [`FakeConnector`]
#[derive(Default)]
pub struct FakeDockerHost {
    state: Mutex<FakeState>,
    connects: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    failing_execs: AtomicUsize,
    fail_connect: AtomicBool,
    probe_fails: AtomicBool,
    fail_start: AtomicBool,
    fail_stats: AtomicBool,
}

impl FakeDockerHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector { host: self.clone() })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Transports currently alive
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> Vec<Vec<String>> {
        self.lock().executed.clone()
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.lock().containers.get(name).map(|c| c.running).unwrap_or(false)
    }

    /// Place a container on the host as if an earlier run had created it
    pub fn seed_container(&self, name: &str, running: bool) {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state
            .containers
            .insert(name.to_string(), FakeContainer { id, running });
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.lock().exec_delay = delay;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    /// The next `n` command executions fail at the transport level
    pub fn fail_next_execs(&self, n: usize) {
        self.failing_execs.store(n, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_fails.store(!ok, Ordering::SeqCst);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stats(&self, fail: bool) {
        self.fail_stats.store(fail, Ordering::SeqCst);
    }

    fn take_transport_failure(&self) -> bool {
        self.failing_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn run(&self, argv: &[String]) -> CommandResult {
        let mut state = self.lock();
        state.executed.push(argv.to_vec());

        match argv.first().map(String::as_str) {
            Some("true") => ok(""),
            Some("echo") => ok(&format!("{}\n", argv[1..].join(" "))),
            Some("docker") => self.docker(&mut state, &argv[1..]),
            Some(other) => fail(127, &format!("sh: {}: command not found", other)),
            None => ok(""),
        }
    }

    fn docker(&self, state: &mut FakeState, args: &[String]) -> CommandResult {
        let sub = args.first().map(String::as_str).unwrap_or("");
        let target = args.last().cloned().unwrap_or_default();
        let missing = || {
            fail(
                1,
                &format!("Error response from daemon: No such container: {}", target),
            )
        };

        match sub {
            "create" => {
                let name = args
                    .iter()
                    .position(|a| a == "--name")
                    .and_then(|i| args.get(i + 1))
                    .cloned()
                    .unwrap_or_default();
                if let Some(existing) = state.containers.get(&name) {
                    return fail(
                        125,
                        &format!(
                            "Error response from daemon: Conflict. The container name \"/{}\" is already in use by container \"{}\". You have to remove (or rename) that container to be able to reuse that name.",
                            name, existing.id
                        ),
                    );
                }
                state.next_id += 1;
                let id = format!("{:064x}", state.next_id);
                state.containers.insert(
                    name,
                    FakeContainer {
                        id: id.clone(),
                        running: false,
                    },
                );
                ok(&format!("{}\n", id))
            }
            "inspect" => match state.containers.get(&target) {
                Some(c) => ok(&format!("{}\n", c.id)),
                None => fail(1, &format!("Error: No such object: {}", target)),
            },
            "start" => {
                if self.fail_start.load(Ordering::SeqCst) {
                    return fail(
                        1,
                        "Error response from daemon: driver failed programming external connectivity: Bind for 0.0.0.0:20000 failed: port is already allocated",
                    );
                }
                match state.containers.get_mut(&target) {
                    Some(c) => {
                        c.running = true;
                        ok(&format!("{}\n", target))
                    }
                    None => missing(),
                }
            }
            "stop" => match state.containers.get_mut(&target) {
                Some(c) => {
                    c.running = false;
                    ok(&format!("{}\n", target))
                }
                None => missing(),
            },
            "rm" => match state.containers.remove(&target) {
                Some(_) => ok(&format!("{}\n", target)),
                None => fail(1, &format!("Error: No such container: {}", target)),
            },
            "stats" => {
                if self.fail_stats.load(Ordering::SeqCst) {
                    return fail(1, "Error response from daemon: cgroup stats unavailable");
                }
                match state.containers.get(&target) {
                    Some(c) => {
                        let (cpu, mem) = if c.running {
                            ("2.50%", "48.5MiB / 1GiB")
                        } else {
                            ("0.00%", "0B / 0B")
                        };
                        ok(&format!(
                            "{{\"BlockIO\":\"4.1MB / 0B\",\"CPUPerc\":\"{}\",\"Container\":\"{}\",\"ID\":\"{}\",\"MemPerc\":\"4.74%\",\"MemUsage\":\"{}\",\"Name\":\"{}\",\"NetIO\":\"1.05kB / 656B\",\"PIDs\":\"6\"}}\n",
                            cpu,
                            target,
                            &c.id[..12],
                            mem,
                            target
                        ))
                    }
                    None => missing(),
                }
            }
            "logs" => match state.containers.get(&target) {
                Some(_) => {
                    let t0 = Utc::now() - ChronoDuration::seconds(10);
                    let ts = |offset: i64| {
                        (t0 + ChronoDuration::seconds(offset))
                            .to_rfc3339_opts(SecondsFormat::Nanos, true)
                    };
                    CommandResult {
                        exit_code: 0,
                        stdout: format!(
                            "{} database system is ready to accept connections\n{} checkpoint starting: time\n",
                            ts(0),
                            ts(2)
                        ),
                        stderr: format!("{} WARNING: no usable system locales were found\n", ts(1)),
                    }
                }
                None => missing(),
            },
            _ => fail(1, &format!("docker: '{}' is not a docker command.", sub)),
        }
    }
}

fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn fail(code: i32, stderr: &str) -> CommandResult {
    CommandResult {
        exit_code: code,
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

pub struct FakeConnector {
    host: Arc<FakeDockerHost>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _config: &RemoteHostConfig) -> Result<Box<dyn Transport>, TransportError> {
        let delay = self.host.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.host.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::new("Connection refused (os error 111)"));
        }

        self.host.connects.fetch_add(1, Ordering::SeqCst);
        let open = self.host.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.host.max_open.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(FakeTransport {
            host: self.host.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeTransport {
    host: Arc<FakeDockerHost>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command_line: &str) -> Result<CommandResult, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::new("session closed"));
        }
        let delay = self.host.lock().exec_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.host.take_transport_failure() {
            return Err(TransportError::new("broken pipe"));
        }
        Ok(self.host.run(&shell_words(command_line)))
    }

    async fn probe(&self) -> bool {
        if self.host.probe_fails.load(Ordering::SeqCst) {
            return false;
        }
        matches!(self.exec("true").await, Ok(result) if result.success())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.host.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Notifier that keeps every event
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<InstanceEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<InstanceEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn emit(&self, event: InstanceEvent) {
        self.events
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event);
    }
}

/// Fully wired engine against one fake host named `db-1`
pub struct Harness {
    pub fake: Arc<FakeDockerHost>,
    pub store: Arc<MemoryInstanceStore>,
    pub pools: Arc<PoolRegistry>,
    pub drivers: Arc<DriverRegistry>,
    pub manager: InstanceLifecycleManager,
}

pub fn harness_with(notifier: Arc<dyn Notifier>) -> Harness {
    let fake = FakeDockerHost::new();
    let store = Arc::new(MemoryInstanceStore::new());
    let provisioning = ProvisioningConfig {
        command_timeout_secs: 5,
        stop_timeout_secs: 1,
        ..ProvisioningConfig::default()
    };
    let pools = Arc::new(PoolRegistry::new(&[host_config("db-1")], fake.connector()));
    let drivers = Arc::new(DriverRegistry::new(&pools, &provisioning, 100));
    let manager = InstanceLifecycleManager::new(
        store.clone(),
        notifier,
        drivers.clone(),
        "db-1",
        provisioning,
    );
    Harness {
        fake,
        store,
        pools,
        drivers,
        manager,
    }
}

pub fn harness() -> (Harness, Arc<RecordingNotifier>) {
    let events = Arc::new(RecordingNotifier::default());
    (harness_with(events.clone()), events)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::remote::shell_quote;

    #[test]
    fn test_shell_words_undo_quoting() {
        let words = ["docker", "it's", "a b", "$(id)", "", "{{json .}}"];
        let line = words.iter().map(|w| shell_quote(w)).collect::<Vec<_>>().join(" ");
        assert_eq!(shell_words(&line), words);
    }
}
