//! Network task: link, registration, delivery, flushing and heartbeats.
//!
//! The network task is the only owner of the credential and the link state.
//! Each [`NetworkTask::tick`] runs the periodic duties that are due and
//! handles at most one event from the scan task:
//!
//! ```text
//! DISCONNECTED ─► CONNECTING ─► CONNECTED ─► REGISTERED
//!       ▲              │            │ 401       │ link lost
//!       └──────────────┴────────────┴───────────┘
//! ```
//!
//! Delivery is the single place that decides an event must be buffered.
//! Backend failures are classified as [`TapinError`]s: transport errors are
//! retried, a rejected credential re-registers, anything else buffers.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, EventRequest, EventResponse, HeartbeatRequest, RegisterRequest};
use crate::clock::SyncClock;
use crate::config::{BufferConfig, DeliveryConfig, DeviceConfig, NetworkConfig, ReaderConfig};
use crate::display::DisplayMessage;
use crate::error::TapinError;
use crate::identity::{Credential, IdentityRecord, IdentityStore};
use crate::link::{Connectivity, LinkStateWriter, ScanFaults};
use crate::retry::Backoff;
use crate::storage::{PushOutcome, SharedBuffer};
use crate::types::{EventKind, EventOutcome, ScanEvent};
use crate::watchdog::WatchdogToken;
use crate::wifi::{LinkManager, WifiLink};

/// What the network task shares with the other tasks.
#[derive(Debug)]
pub struct NetworkChannels {
    /// Events from the scan task.
    pub events: mpsc::Receiver<ScanEvent>,
    /// Outcomes back to the scan task.
    pub outcomes: mpsc::Sender<EventOutcome>,
    /// Announcements for the display task.
    pub display: mpsc::Sender<DisplayMessage>,
    /// Failures recorded by the scan task, folded into the counters.
    pub scan_faults: Arc<ScanFaults>,
}

#[derive(Debug)]
struct Schedule {
    link_check: Instant,
    registration: Instant,
    flush: Instant,
    heartbeat: Instant,
    compaction: Instant,
}

/// Owns connectivity and every backend exchange.
pub struct NetworkTask<B, W> {
    backend: B,
    link: LinkManager<W>,
    identity: IdentityStore,
    record: IdentityRecord,
    buffer: SharedBuffer,
    holding: VecDeque<ScanEvent>,
    holding_capacity: usize,
    // Buffered entries the backend acknowledged but flash still holds.
    delivered: BTreeSet<u64>,
    state: LinkStateWriter,
    clock: SyncClock,
    channels: NetworkChannels,
    watchdog: WatchdogToken,
    device: DeviceConfig,
    delivery: DeliveryConfig,
    network: NetworkConfig,
    buffering: BufferConfig,
    backoff: Backoff,
    link_check_interval: Duration,
    recv_timeout: Duration,
    lock_timeout: Duration,
    schedule: Schedule,
    started: Instant,
}

impl<B: Backend, W: WifiLink> NetworkTask<B, W> {
    /// Create the task, loading the persisted identity record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ReaderConfig,
        backend: B,
        wifi: W,
        identity: IdentityStore,
        buffer: SharedBuffer,
        state: LinkStateWriter,
        clock: SyncClock,
        channels: NetworkChannels,
        watchdog: WatchdogToken,
    ) -> Self {
        let record = identity.load().unwrap_or_else(|e| {
            warn!(error = %e, "identity record unreadable, starting unregistered");
            state.count(|c| &mut c.storage_errors);
            IdentityRecord::default()
        });
        state.update(|s| s.registered = record.credential.is_some());

        let now = Instant::now();
        Self {
            backend,
            link: LinkManager::new(wifi, &config.wifi).with_watchdog(watchdog.clone()),
            identity,
            record,
            buffer,
            holding: VecDeque::with_capacity(config.timing.queue_capacity),
            holding_capacity: config.timing.queue_capacity,
            delivered: BTreeSet::new(),
            state,
            clock,
            channels,
            watchdog,
            device: config.device.clone(),
            delivery: config.delivery.clone(),
            network: config.network.clone(),
            buffering: config.buffer.clone(),
            backoff: Backoff::from_config(&config.delivery),
            link_check_interval: Duration::from_millis(config.wifi.check_interval_ms),
            recv_timeout: config.timing.queue_recv_timeout(),
            lock_timeout: config.timing.lock_timeout(),
            schedule: Schedule {
                link_check: now,
                registration: now,
                flush: now,
                heartbeat: now,
                compaction: now,
            },
            started: now,
        }
    }

    /// Run until the scan task drops its sender.
    pub async fn run(mut self) {
        info!(device = %self.device.id, "network task started");
        while self.tick().await {}
        info!("event queue closed, network task stopping");
    }

    /// One pass of the control loop. Returns `false` once the event queue
    /// is closed.
    pub async fn tick(&mut self) -> bool {
        self.watchdog.checkpoint();

        if Instant::now() >= self.schedule.link_check {
            self.check_link().await;
            self.schedule.link_check = Instant::now() + self.link_check_interval;
        }

        if self.is_connected()
            && self.record.credential.is_none()
            && Instant::now() >= self.schedule.registration
        {
            self.register().await;
            self.schedule.registration =
                Instant::now() + Duration::from_millis(self.network.registration_retry_ms);
        }

        match tokio::time::timeout(self.recv_timeout, self.channels.events.recv()).await {
            Ok(Some(event)) => self.handle_event(event).await,
            Ok(None) => return false,
            Err(_) => {}
        }

        if self.is_online() && Instant::now() >= self.schedule.flush {
            self.flush().await;
            self.schedule.flush =
                Instant::now() + Duration::from_millis(self.buffering.flush_interval_ms);
        }

        if self.is_online() && Instant::now() >= self.schedule.heartbeat {
            self.heartbeat().await;
            self.schedule.heartbeat =
                Instant::now() + Duration::from_millis(self.network.heartbeat_interval_ms);
        }

        if Instant::now() >= self.schedule.compaction {
            self.compact().await;
            self.schedule.compaction =
                Instant::now() + Duration::from_millis(self.buffering.compaction_interval_ms);
        }

        self.state.absorb(&self.channels.scan_faults);
        self.publish_depth().await;
        true
    }

    fn is_connected(&self) -> bool {
        self.state.snapshot().connectivity == Connectivity::Connected
    }

    fn is_online(&self) -> bool {
        self.is_connected() && self.record.credential.is_some()
    }

    fn token(&self) -> Option<String> {
        self.record.credential.as_ref().map(|c| c.token.clone())
    }

    fn announce(&self, message: DisplayMessage) {
        if self.channels.display.try_send(message).is_err() {
            debug!("display queue full, dropping announcement");
        }
    }

    fn persist_identity(&self) {
        if let Err(e) = self.identity.save(&self.record) {
            warn!(error = %e, "identity record not persisted");
            self.state.count(|c| &mut c.storage_errors);
        }
    }

    async fn check_link(&mut self) {
        if self.link.is_connected().await {
            if !self.is_connected() {
                self.state.update(|s| s.connectivity = Connectivity::Connected);
            }
            return;
        }

        if self.is_connected() {
            warn!("link lost");
            self.state.count(|c| &mut c.link_drops);
        }
        self.state.update(|s| {
            s.connectivity = Connectivity::Connecting;
            s.profile = None;
        });
        self.announce(DisplayMessage::Connecting);

        match self.link.reconnect(self.record.remembered_profile.as_ref()).await {
            Ok(profile) => {
                self.state.update(|s| {
                    s.connectivity = Connectivity::Connected;
                    s.profile = Some(profile.ssid.clone());
                });
                if self.record.remembered_profile.as_ref() != Some(&profile) {
                    self.record.remembered_profile = Some(profile);
                    self.persist_identity();
                }
                if self.record.credential.is_some() {
                    self.announce(DisplayMessage::Ready);
                }
            }
            Err(e) => {
                warn!(error = %e, "no network reachable");
                self.state.update(|s| s.connectivity = Connectivity::Disconnected);
                self.announce(DisplayMessage::error("No network"));
            }
        }
    }

    async fn register(&mut self) -> bool {
        let request = RegisterRequest {
            device_id: self.device.id.clone(),
            secret: self.device.provisioning_secret.clone(),
            name: self.device.name.clone(),
            location: self.device.location.clone(),
        };

        match self.backend.register(&request).await.map_err(TapinError::from) {
            Ok(registration) => {
                let expires_at = registration
                    .response
                    .expires_at
                    .as_deref()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc));
                info!(reissued = registration.reissued, "device registered");
                self.record.credential = Some(Credential {
                    token: registration.response.token,
                    expires_at,
                });
                self.persist_identity();
                self.state.update(|s| s.registered = true);
                self.announce(DisplayMessage::Ready);
                true
            }
            Err(TapinError::SecretMismatch) => {
                error!(device = %self.device.id, "provisioning secret rejected");
                self.announce(DisplayMessage::error("Secret rejected"));
                false
            }
            Err(e) => {
                if e.is_transport_error() {
                    self.state.count(|c| &mut c.transport_errors);
                }
                warn!(code = e.error_code(), error = %e, "registration failed");
                false
            }
        }
    }

    fn forget_credential(&mut self) {
        self.state.count(|c| &mut c.credential_expirations);
        self.record.credential = None;
        self.persist_identity();
        self.state.update(|s| s.registered = false);
        self.schedule.registration = Instant::now();
    }

    fn event_request(&self, event: &ScanEvent) -> EventRequest {
        EventRequest {
            device_id: self.device.id.clone(),
            tag_id: event.tag.as_str().to_string(),
            timestamp: event.timestamp.as_str().to_string(),
            rssi: event.rssi,
        }
    }

    async fn handle_event(&mut self, event: ScanEvent) {
        let outcome = if self.is_online() {
            match self.deliver(&event).await {
                Ok(response) => {
                    let kind = EventKind::from_backend(&response.kind);
                    info!(tag = %event.tag, kind = kind.as_str(), "event delivered");
                    EventOutcome::delivered(event.seq, &response.name, kind)
                }
                Err(e) => {
                    warn!(
                        tag = %event.tag,
                        code = e.error_code(),
                        error = %e,
                        "delivery failed, buffering"
                    );
                    self.buffer_event(event).await
                }
            }
        } else {
            debug!(tag = %event.tag, "offline, buffering");
            self.buffer_event(event).await
        };

        let message = if outcome.success {
            DisplayMessage::Success {
                name: outcome.name.clone(),
                kind: outcome.kind,
            }
        } else if outcome.buffered {
            DisplayMessage::Buffered
        } else {
            DisplayMessage::error("Scan not saved")
        };
        self.announce(message);
        if self.channels.outcomes.try_send(outcome).is_err() {
            debug!("outcome queue full, scan task will time out");
        }
    }

    /// Deliver with bounded retries. A 401 re-registers and retries with the
    /// new credential without consuming an attempt.
    async fn deliver(&mut self, event: &ScanEvent) -> crate::error::Result<EventResponse> {
        let request = self.event_request(event);
        let mut failures = 0;
        let mut reauths = 0;

        loop {
            let Some(token) = self.token() else {
                return Err(TapinError::CredentialRejected);
            };

            match self
                .backend
                .post_event(&token, &request)
                .await
                .map_err(TapinError::from)
            {
                Ok(response) => return Ok(response),
                Err(TapinError::CredentialRejected) if reauths < self.delivery.max_reauth => {
                    reauths += 1;
                    warn!(tag = %event.tag, "credential rejected, re-registering");
                    self.forget_credential();
                    if !self.register().await {
                        return Err(TapinError::CredentialRejected);
                    }
                }
                Err(e) => {
                    let transport = e.is_transport_error();
                    if transport {
                        self.state.count(|c| &mut c.transport_errors);
                    }
                    failures += 1;
                    if failures >= self.delivery.max_attempts || !transport {
                        return Err(e);
                    }
                    let delay = self.backoff.delay(failures);
                    debug!(tag = %event.tag, failures, ?delay, error = %e, "delivery retry");
                    self.watchdog.checkpoint();
                    tokio::time::sleep(delay).await;
                    self.watchdog.checkpoint();
                }
            }
        }
    }

    async fn buffer_event(&mut self, event: ScanEvent) -> EventOutcome {
        let pushed = match self.buffer.acquire(self.lock_timeout).await {
            Ok(mut buffer) => buffer.push(&event).map_err(TapinError::from),
            Err(e) => Err(e),
        };

        let seq = event.seq;
        match pushed {
            Ok(PushOutcome::Stored(id)) => {
                debug!(tag = %event.tag, id, "event buffered");
                EventOutcome::buffered(seq)
            }
            Ok(PushOutcome::StoredEvictingOldest { id, evicted }) => {
                warn!(tag = %event.tag, id, evicted, "buffer full, oldest event evicted");
                self.state.count(|c| &mut c.buffer_overflows);
                EventOutcome::buffered(seq)
            }
            Ok(PushOutcome::Rejected) => {
                warn!(tag = %event.tag, "buffer full, newest event dropped");
                self.state.count(|c| &mut c.buffer_overflows);
                EventOutcome::failed(seq)
            }
            Err(e) => {
                warn!(
                    tag = %event.tag,
                    code = e.error_code(),
                    error = %e,
                    "storage unavailable, holding in memory"
                );
                if e.is_storage_error() {
                    self.state.count(|c| &mut c.storage_errors);
                }
                self.hold(event)
            }
        }
    }

    fn hold(&mut self, event: ScanEvent) -> EventOutcome {
        let seq = event.seq;
        if self.holding.len() < self.holding_capacity {
            self.holding.push_back(event);
            EventOutcome::buffered(seq)
        } else {
            error!(tag = %event.tag, "holding queue full, scan lost");
            self.state.count(|c| &mut c.buffer_overflows);
            EventOutcome::failed(seq)
        }
    }

    /// One delivery attempt for a buffered event.
    async fn flush_one(&mut self, event: &ScanEvent) -> bool {
        let Some(token) = self.token() else {
            return false;
        };
        let request = self.event_request(event);
        match self
            .backend
            .post_event(&token, &request)
            .await
            .map_err(TapinError::from)
        {
            Ok(_) => true,
            Err(TapinError::CredentialRejected) => {
                warn!("credential rejected during flush");
                self.forget_credential();
                false
            }
            Err(e) => {
                if e.is_transport_error() {
                    self.state.count(|c| &mut c.transport_errors);
                }
                debug!(code = e.error_code(), error = %e, "flush aborted");
                false
            }
        }
    }

    /// Delete a delivered entry from flash. A failure is remembered so the
    /// entry is retried for removal, never resent.
    async fn remove_delivered(&mut self, id: u64) -> bool {
        let removed = match self.buffer.acquire(self.lock_timeout).await {
            Ok(mut buffer) => buffer.remove(id).map_err(TapinError::from),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {
                self.delivered.remove(&id);
                true
            }
            Err(e) => {
                warn!(id, code = e.error_code(), error = %e, "delivered entry not removed");
                if e.is_storage_error() {
                    self.state.count(|c| &mut c.storage_errors);
                }
                self.delivered.insert(id);
                false
            }
        }
    }

    async fn flush(&mut self) {
        let batch = self.buffering.flush_batch;
        let mut sent = 0;

        while sent < batch {
            self.watchdog.checkpoint();
            let Some(event) = self.holding.front().cloned() else {
                break;
            };
            if !self.flush_one(&event).await {
                return;
            }
            self.holding.pop_front();
            sent += 1;
        }

        for id in self.delivered.clone() {
            self.remove_delivered(id).await;
        }

        if sent < batch {
            let entries: Vec<_> = match self.buffer.acquire(self.lock_timeout).await {
                Ok(buffer) => buffer
                    .oldest(batch - sent + self.delivered.len())
                    .into_iter()
                    .filter(|entry| !self.delivered.contains(&entry.id))
                    .take(batch - sent)
                    .collect(),
                Err(e) => {
                    debug!(error = %e, "flush skipped");
                    return;
                }
            };
            for entry in entries {
                self.watchdog.checkpoint();
                if !self.flush_one(&entry.event).await {
                    break;
                }
                sent += 1;
                if !self.remove_delivered(entry.id).await {
                    break;
                }
            }
        }

        if sent > 0 {
            info!(sent, "flushed buffered events");
        }
    }

    async fn heartbeat(&mut self) {
        let Some(token) = self.token() else {
            return;
        };
        let snapshot = self.state.snapshot();
        let request = HeartbeatRequest {
            device_id: self.device.id.clone(),
            firmware_version: self.device.firmware_version.clone(),
            buffer_depth: snapshot.buffered,
            uptime_secs: self.started.elapsed().as_secs(),
            free_memory: 0,
            counters: snapshot.counters,
        };

        match self
            .backend
            .heartbeat(&token, &request)
            .await
            .map_err(TapinError::from)
        {
            Ok(response) => match DateTime::parse_from_rfc3339(&response.server_time) {
                Ok(server_time) => self.clock.sync_to(server_time.with_timezone(&Utc)),
                Err(e) => {
                    warn!(server_time = %response.server_time, error = %e, "clock not synced");
                    self.state.count(|c| &mut c.clock_sync_failures);
                }
            },
            Err(TapinError::CredentialRejected) => {
                warn!("credential rejected on heartbeat");
                self.forget_credential();
            }
            Err(e) => {
                if e.is_transport_error() {
                    self.state.count(|c| &mut c.transport_errors);
                }
                warn!(code = e.error_code(), error = %e, "heartbeat failed");
            }
        }
    }

    async fn compact(&mut self) {
        let compacted = match self.buffer.acquire(self.lock_timeout).await {
            Ok(mut buffer) => buffer.compact().map_err(TapinError::from),
            Err(e) => Err(e),
        };
        match compacted {
            Ok(report) => {
                if report.corrupt_dropped > 0 {
                    self.state.update(|s| {
                        s.counters.corrupt_entries_dropped = s
                            .counters
                            .corrupt_entries_dropped
                            .saturating_add(report.corrupt_dropped);
                    });
                }
            }
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "buffer compaction failed");
                if e.is_storage_error() {
                    self.state.count(|c| &mut c.storage_errors);
                }
            }
        }
    }

    async fn publish_depth(&mut self) {
        if let Ok(buffer) = self.buffer.acquire(self.lock_timeout).await {
            let awaiting_removal = self
                .delivered
                .iter()
                .filter(|id| buffer.contains(**id))
                .count();
            let depth = buffer.len() - awaiting_removal + self.holding.len();
            drop(buffer);
            self.state.update(|s| s.buffered = depth);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, HeartbeatResponse, RegisterResponse, Registration};
    use crate::config::{OverflowPolicy, WatchdogConfig, WifiProfile};
    use crate::link::{link_state, LinkStateHandle};
    use crate::storage::{EventBuffer, Storage};
    use crate::types::IsoTimestamp;
    use crate::watchdog::Watchdog;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Register,
        Event { token: String, tag: String },
        Heartbeat,
    }

    #[derive(Default)]
    struct Script {
        register: VecDeque<Result<Registration, BackendError>>,
        events: VecDeque<Result<EventResponse, BackendError>>,
        heartbeats: VecDeque<Result<HeartbeatResponse, BackendError>>,
        server_time: Option<String>,
        // Swapped for a directory on the next event, so it cannot be removed.
        unremovable: Option<PathBuf>,
        issued: u32,
        calls: Vec<Call>,
    }

    #[derive(Clone, Default)]
    struct ScriptedBackend(Arc<Mutex<Script>>);

    impl ScriptedBackend {
        fn calls(&self) -> Vec<Call> {
            self.0.lock().unwrap().calls.clone()
        }

        fn event_calls(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Event { .. }))
                .count()
        }

        fn fail_events(&self, errors: impl IntoIterator<Item = BackendError>) {
            self.0
                .lock()
                .unwrap()
                .events
                .extend(errors.into_iter().map(Err));
        }
    }

    impl Backend for ScriptedBackend {
        async fn register(&self, _: &RegisterRequest) -> Result<Registration, BackendError> {
            let mut script = self.0.lock().unwrap();
            script.calls.push(Call::Register);
            script.register.pop_front().unwrap_or_else(|| {
                script.issued += 1;
                Ok(Registration {
                    response: RegisterResponse {
                        token: format!("tok-{}", script.issued),
                        expires_at: None,
                    },
                    reissued: script.issued > 1,
                })
            })
        }

        async fn post_event(
            &self,
            token: &str,
            request: &EventRequest,
        ) -> Result<EventResponse, BackendError> {
            let mut script = self.0.lock().unwrap();
            script.calls.push(Call::Event {
                token: token.to_string(),
                tag: request.tag_id.clone(),
            });
            if let Some(path) = script.unremovable.take() {
                std::fs::remove_file(&path).unwrap();
                std::fs::create_dir(&path).unwrap();
            }
            script.events.pop_front().unwrap_or_else(|| {
                Ok(EventResponse {
                    name: "Ada".into(),
                    kind: "entry".into(),
                })
            })
        }

        async fn heartbeat(
            &self,
            _: &str,
            _: &HeartbeatRequest,
        ) -> Result<HeartbeatResponse, BackendError> {
            let mut script = self.0.lock().unwrap();
            script.calls.push(Call::Heartbeat);
            let server_time = script
                .server_time
                .clone()
                .unwrap_or_else(|| "2026-03-02T08:30:00Z".into());
            script
                .heartbeats
                .pop_front()
                .unwrap_or(Ok(HeartbeatResponse { server_time }))
        }
    }

    struct FakeLink {
        up: Arc<AtomicBool>,
        reachable: Arc<AtomicBool>,
    }

    impl WifiLink for FakeLink {
        async fn is_connected(&mut self) -> bool {
            self.up.load(Ordering::SeqCst)
        }

        async fn connect(&mut self, _: &WifiProfile) -> crate::error::Result<()> {
            if self.reachable.load(Ordering::SeqCst) {
                self.up.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(TapinError::Transport("no beacon".into()))
            }
        }
    }

    struct Harness {
        task: NetworkTask<ScriptedBackend, FakeLink>,
        backend: ScriptedBackend,
        events: mpsc::Sender<ScanEvent>,
        outcomes: mpsc::Receiver<EventOutcome>,
        _display: mpsc::Receiver<DisplayMessage>,
        link: LinkStateHandle,
        clock: SyncClock,
        storage: Storage,
        buffer: SharedBuffer,
        up: Arc<AtomicBool>,
        reachable: Arc<AtomicBool>,
        scan_faults: Arc<ScanFaults>,
        _dir: tempfile::TempDir,
    }

    fn harness(reachable: bool, preload: &[&str]) -> Harness {
        harness_with(reachable, preload, |_| {})
    }

    fn harness_with(
        reachable: bool,
        preload: &[&str],
        configure: impl FnOnce(&mut ReaderConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let mut config = ReaderConfig::default();
        config.wifi.networks = vec![WifiProfile::open("office")];
        config.wifi.attempts_per_profile = 1;
        configure(&mut config);

        let mut buffer = EventBuffer::open(
            storage.buffer_dir(),
            config.buffer.capacity,
            config.buffer.overflow_policy,
        )
        .unwrap();
        for tag in preload {
            buffer.push(&event(tag)).unwrap();
        }
        let buffer = buffer.shared();

        let backend = ScriptedBackend::default();
        let (state, link) = link_state();
        let clock = SyncClock::new();
        let (event_tx, event_rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = mpsc::channel(4);
        let (display_tx, display_rx) = mpsc::channel(16);
        let mut watchdog = Watchdog::new(&WatchdogConfig::default());
        let up = Arc::new(AtomicBool::new(false));
        let reachable = Arc::new(AtomicBool::new(reachable));
        let scan_faults = Arc::new(ScanFaults::default());

        let task = NetworkTask::new(
            &config,
            backend.clone(),
            FakeLink {
                up: Arc::clone(&up),
                reachable: Arc::clone(&reachable),
            },
            IdentityStore::new(storage.identity_path()),
            Arc::clone(&buffer),
            state,
            clock.clone(),
            NetworkChannels {
                events: event_rx,
                outcomes: outcome_tx,
                display: display_tx,
                scan_faults: Arc::clone(&scan_faults),
            },
            watchdog.register("network"),
        );

        Harness {
            task,
            backend,
            events: event_tx,
            outcomes: outcome_rx,
            _display: display_rx,
            link,
            clock,
            storage,
            buffer,
            up,
            reachable,
            scan_faults,
            _dir: dir,
        }
    }

    fn entry_path(h: &Harness, id: u64) -> PathBuf {
        h.storage.buffer_dir().join(format!("{id:020}.evt"))
    }

    fn event(tag: &str) -> ScanEvent {
        ScanEvent::new(tag, IsoTimestamp::truncated("2026-03-02T08:00:00Z"), -40)
    }

    async fn buffered(h: &Harness) -> Vec<String> {
        let buffer = h.buffer.acquire(Duration::from_millis(10)).await.unwrap();
        buffer
            .oldest(usize::MAX)
            .into_iter()
            .map(|e| e.event.tag.as_str().to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_connects_registers_and_syncs() {
        let mut h = harness(true, &[]);
        assert!(h.task.tick().await);

        let snapshot = h.link.snapshot();
        assert!(snapshot.is_online());
        assert_eq!(snapshot.profile.as_deref(), Some("office"));
        assert!(h.clock.is_synced());
        assert_eq!(h.backend.calls(), [Call::Register, Call::Heartbeat]);

        let record = IdentityStore::new(h.storage.identity_path()).load().unwrap();
        assert_eq!(record.credential.unwrap().token, "tok-1");
        assert_eq!(record.remembered_profile.unwrap().ssid, "office");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success_delivers_once() {
        let mut h = harness(true, &[]);
        h.task.tick().await;
        h.backend.fail_events([
            BackendError::Transport("reset".into()),
            BackendError::Status(503),
        ]);

        h.events.send(event("04AA")).await.unwrap();
        h.task.tick().await;

        let outcome = h.outcomes.recv().await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.kind, EventKind::Entry);
        assert_eq!(h.backend.event_calls(), 3);
        assert!(buffered(&h).await.is_empty());
        assert_eq!(h.link.snapshot().counters.transport_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_buffer_exactly_once() {
        let mut h = harness(true, &[]);
        h.task.tick().await;
        h.backend
            .fail_events((0..3).map(|_| BackendError::Transport("timeout".into())));

        h.events.send(event("04BB")).await.unwrap();
        h.task.tick().await;

        let outcome = h.outcomes.recv().await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.buffered);
        assert_eq!(h.backend.event_calls(), 3);
        assert_eq!(buffered(&h).await, ["04BB"]);
        assert_eq!(h.link.snapshot().buffered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_reregisters_before_retry() {
        let mut h = harness(true, &[]);
        h.task.tick().await;
        h.backend.fail_events([BackendError::Unauthorized]);

        h.events.send(event("04CC")).await.unwrap();
        h.task.tick().await;

        assert!(h.outcomes.recv().await.unwrap().success);
        let calls: Vec<Call> = h
            .backend
            .calls()
            .into_iter()
            .filter(|c| *c != Call::Heartbeat)
            .collect();
        assert_eq!(
            calls,
            [
                Call::Register,
                Call::Event {
                    token: "tok-1".into(),
                    tag: "04CC".into()
                },
                Call::Register,
                Call::Event {
                    token: "tok-2".into(),
                    tag: "04CC".into()
                },
            ]
        );
        assert_eq!(h.link.snapshot().counters.credential_expirations, 1);
        assert_eq!(h.link.snapshot().counters.transport_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_event_is_buffered_without_delivery() {
        let mut h = harness(false, &[]);
        h.events.send(event("04DD")).await.unwrap();
        h.task.tick().await;

        assert!(h.outcomes.recv().await.unwrap().buffered);
        assert_eq!(h.backend.event_calls(), 0);
        assert_eq!(buffered(&h).await, ["04DD"]);
        assert_eq!(h.link.snapshot().connectivity, Connectivity::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_buffer_in_order() {
        let mut h = harness(true, &["A", "B", "C"]);
        h.task.tick().await;

        let tags: Vec<Call> = h
            .backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Event { .. }))
            .collect();
        assert_eq!(tags.len(), 3);
        assert_eq!(
            tags[0],
            Call::Event {
                token: "tok-1".into(),
                tag: "A".into()
            }
        );
        assert!(buffered(&h).await.is_empty());
        assert_eq!(h.link.snapshot().buffered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_aborts_on_first_failure() {
        let mut h = harness(true, &["A", "B", "C"]);
        {
            let mut script = h.backend.0.lock().unwrap();
            script.events.push_back(Ok(EventResponse::default()));
            script
                .events
                .push_back(Err(BackendError::Transport("reset".into())));
        }
        h.task.tick().await;

        assert_eq!(h.backend.event_calls(), 2);
        assert_eq!(buffered(&h).await, ["B", "C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_server_time_is_counted() {
        let mut h = harness(true, &[]);
        h.backend.0.lock().unwrap().server_time = Some("yesterday".into());
        h.task.tick().await;

        assert!(!h.clock.is_synced());
        assert_eq!(h.link.snapshot().counters.clock_sync_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_holds_in_memory() {
        let mut h = harness(false, &[]);
        h.task.tick().await;
        std::fs::remove_dir_all(h.storage.buffer_dir()).unwrap();
        std::fs::write(h.storage.buffer_dir(), b"").unwrap();

        h.events.send(event("04EE")).await.unwrap();
        h.task.tick().await;

        assert!(h.outcomes.recv().await.unwrap().buffered);
        let snapshot = h.link.snapshot();
        assert_eq!(snapshot.counters.storage_errors, 1);
        assert_eq!(snapshot.buffered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_secret_mismatch_stays_unregistered() {
        let mut h = harness(true, &[]);
        h.backend
            .0
            .lock()
            .unwrap()
            .register
            .push_back(Err(BackendError::Forbidden));
        h.task.tick().await;

        let snapshot = h.link.snapshot();
        assert_eq!(snapshot.connectivity, Connectivity::Connected);
        assert!(!snapshot.registered);
        assert_eq!(h.backend.calls(), [Call::Register]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcome_carries_event_seq() {
        let mut h = harness(true, &[]);
        h.task.tick().await;

        h.events.send(event("04AA").with_seq(7)).await.unwrap();
        h.task.tick().await;
        assert_eq!(h.outcomes.recv().await.unwrap().seq, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_is_counted() {
        let mut h = harness(true, &[]);
        h.task.tick().await;
        assert_eq!(h.link.snapshot().connectivity, Connectivity::Connected);

        h.up.store(false, Ordering::SeqCst);
        h.reachable.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_millis(5_100)).await;
        h.task.tick().await;

        let snapshot = h.link.snapshot();
        assert_eq!(snapshot.connectivity, Connectivity::Disconnected);
        assert_eq!(snapshot.profile, None);
        assert_eq!(snapshot.counters.link_drops, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_drop_newest_fails_event() {
        let mut h = harness_with(false, &["A"], |config| {
            config.buffer.capacity = 1;
            config.buffer.overflow_policy = OverflowPolicy::DropNewest;
        });
        h.events.send(event("B")).await.unwrap();
        h.task.tick().await;

        let outcome = h.outcomes.recv().await.unwrap();
        assert!(!outcome.success && !outcome.buffered);
        assert_eq!(buffered(&h).await, ["A"]);
        assert_eq!(h.link.snapshot().counters.buffer_overflows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_drop_oldest_evicts_and_counts() {
        let mut h = harness_with(false, &["A"], |config| {
            config.buffer.capacity = 1;
            config.buffer.overflow_policy = OverflowPolicy::DropOldest;
        });
        h.events.send(event("B")).await.unwrap();
        h.task.tick().await;

        assert!(h.outcomes.recv().await.unwrap().buffered);
        assert_eq!(buffered(&h).await, ["B"]);
        assert_eq!(h.link.snapshot().counters.buffer_overflows, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_unauthorized_reregisters_next_tick() {
        let mut h = harness(true, &[]);
        h.backend
            .0
            .lock()
            .unwrap()
            .heartbeats
            .push_back(Err(BackendError::Unauthorized));

        h.task.tick().await;
        let snapshot = h.link.snapshot();
        assert!(!snapshot.registered);
        assert_eq!(snapshot.counters.credential_expirations, 1);

        h.task.tick().await;
        assert!(h.link.snapshot().registered);
        assert_eq!(h.backend.calls(), [Call::Register, Call::Heartbeat, Call::Register]);
        let record = IdentityStore::new(h.storage.identity_path()).load().unwrap();
        assert_eq!(record.credential.unwrap().token, "tok-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_compaction_counts_corrupt_entries() {
        let mut h = harness(false, &["A", "B"]);
        std::fs::write(entry_path(&h, 2), b"TAPN\x01").unwrap();
        h.task.tick().await;

        let snapshot = h.link.snapshot();
        assert_eq!(snapshot.counters.corrupt_entries_dropped, 1);
        assert_eq!(snapshot.buffered, 1);
        assert_eq!(buffered(&h).await, ["A"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_faults_reach_heartbeat_counters() {
        let mut h = harness(false, &[]);
        h.scan_faults.record_overflow();
        h.scan_faults.record_storage_error();
        h.task.tick().await;
        h.task.tick().await;

        let counters = h.link.snapshot().counters;
        assert_eq!(counters.buffer_overflows, 1);
        assert_eq!(counters.storage_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivered_entry_is_never_resent() {
        let mut h = harness(true, &["A", "B"]);
        h.backend.0.lock().unwrap().unremovable = Some(entry_path(&h, 1));

        // A is acknowledged but stays on flash; the flush stops there.
        h.task.tick().await;
        assert_eq!(h.backend.event_calls(), 1);
        let snapshot = h.link.snapshot();
        assert_eq!(snapshot.counters.storage_errors, 1);
        assert_eq!(snapshot.buffered, 1);

        tokio::time::advance(Duration::from_millis(2_100)).await;
        h.task.tick().await;
        let tags: Vec<Call> = h
            .backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Event { .. }))
            .collect();
        assert_eq!(
            tags,
            [
                Call::Event {
                    token: "tok-1".into(),
                    tag: "A".into()
                },
                Call::Event {
                    token: "tok-1".into(),
                    tag: "B".into()
                },
            ]
        );

        std::fs::remove_dir(entry_path(&h, 1)).unwrap();
        tokio::time::advance(Duration::from_millis(2_100)).await;
        h.task.tick().await;
        assert_eq!(h.backend.event_calls(), 2);
        assert_eq!(h.link.snapshot().buffered, 0);
        assert!(buffered(&h).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_stops_task() {
        let mut h = harness(false, &[]);
        drop(h.events);
        assert!(!h.task.tick().await);
    }
}
