//! Session registry and aquarium manager
//!
//! One [`AquariumManager`] owns every session and the current epoch behind a
//! single mutex. An epoch starts when the first session registers and is
//! destroyed when the last one leaves; a later session starts a fresh epoch
//! and negotiates the terminal capability again.
//!
//! The scheduler, the negotiation and every session reader are separate
//! tasks that only meet inside the lock. Writes to sessions never happen
//! under the lock: frames are queued on each session's [`Outbound`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aquarium::constants::{chrome, timing};
use crate::aquarium::render::{
    clear_poof, render_all, render_departure, render_floor, render_status, RenderBuffer,
};
use crate::aquarium::state::{Fish, FishId, GridSize, Poof, SessionId, TerminalCapability};
use crate::aquarium::systems::interaction::{handle_click, ClickOutcome};
use crate::aquarium::systems::physics;
use crate::assets::SpriteAssets;
use crate::config::EngineConfig;
use crate::metrics::Metrics;
use crate::net::input::{InputDecoder, InputEvent, PixelReport};
use crate::net::negotiate::negotiate;
use crate::net::sink::{Outbound, QueueError, SessionSink};
use crate::net::terminal::{SETUP, TEARDOWN};

/// What the transport knows about a session when it opens
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub display_name: String,
    pub grid: GridSize,
}

struct SessionEntry {
    outbound: Outbound,
    display_name: String,
    grid: GridSize,
    fish: Vec<FishId>,
}

/// The pending pixel-size wait; dropping `reports` resolves it to defaults
struct Negotiation {
    target: SessionId,
    reports: oneshot::Sender<PixelReport>,
}

struct Epoch {
    generation: u64,
    started: Instant,
    last_tick: Instant,
    capability: Option<TerminalCapability>,
    fishes: HashMap<FishId, Fish>,
    next_fish_id: FishId,
    floor_tile: usize,
    floor_rendered: bool,
    last_status: Option<Instant>,
    poofs: Vec<Poof>,
    cancel: CancellationToken,
    scheduler: Option<JoinHandle<()>>,
    negotiation: Option<Negotiation>,
}

impl Epoch {
    /// Next fish id, skipping the placement ids reserved for floor tiles
    fn allocate_fish_id(&mut self) -> FishId {
        let id = self.next_fish_id;
        let next = id.wrapping_add(1).max(1);
        self.next_fish_id = if (chrome::FLOOR_PLACEMENT_BASE..chrome::FLOOR_PLACEMENT_END).contains(&next) {
            chrome::FLOOR_PLACEMENT_END
        } else {
            next
        };
        id
    }

    fn spawn_fish(&mut self, owner: SessionId, entry: &mut SessionEntry, count: usize, capability: &TerminalCapability) {
        let mut rng = rand::thread_rng();
        for _ in 0..count {
            let id = self.allocate_fish_id();
            let fish = Fish::spawn(id, owner, entry.display_name.clone(), capability, &mut rng);
            self.fishes.insert(id, fish);
            entry.fish.push(id);
        }
        debug!("Spawned {} fish for {}", count, owner);
    }

    /// Render one tick's output. Physics has already run.
    fn render(&mut self, capability: &TerminalCapability, now: Instant) -> Bytes {
        let mut buf = RenderBuffer::new();

        self.poofs.retain_mut(|poof| {
            poof.ttl = poof.ttl.saturating_sub(1);
            if poof.ttl == 0 {
                clear_poof(&mut buf, poof);
                false
            } else {
                true
            }
        });

        render_all(&mut buf, &mut self.fishes, capability);

        if !self.floor_rendered {
            render_floor(&mut buf, capability, self.floor_tile);
            self.floor_rendered = true;
        }

        let status_due = self.last_status.map_or(true, |at| {
            now.duration_since(at) >= Duration::from_millis(chrome::STATUS_INTERVAL_MS)
        });
        if status_due {
            render_status(&mut buf, capability, self.fishes.values(), now.duration_since(self.started));
            self.last_status = Some(now);
        }

        buf.into_bytes()
    }
}

impl Drop for Epoch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    epoch: Option<Epoch>,
    next_generation: u64,
}

struct Shared {
    state: Mutex<RegistryState>,
    config: EngineConfig,
    assets: Arc<SpriteAssets>,
    metrics: Arc<Metrics>,
    next_session: AtomicU64,
}

/// Handle to the shared aquarium; clones refer to the same state
#[derive(Clone)]
pub struct AquariumManager {
    shared: Arc<Shared>,
}

impl AquariumManager {
    pub fn new(config: EngineConfig, assets: Arc<SpriteAssets>, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState {
                    sessions: HashMap::new(),
                    epoch: None,
                    next_generation: 1,
                }),
                config,
                assets,
                metrics,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    /// Register a new session and return its id.
    ///
    /// Must be called from within a tokio runtime. The first session of an
    /// epoch starts the scheduler and the capability negotiation; neither is
    /// awaited here.
    pub fn register(&self, sink: Arc<dyn SessionSink>, profile: SessionProfile) -> SessionId {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        let outbound = self.spawn_outbound(id, sink);

        for frame in [Bytes::from_static(SETUP), self.shared.assets.upload_sequence()] {
            if let Err(e) = outbound.try_send(frame) {
                debug!("{} setup frame not queued: {}", id, e);
            }
        }

        let mut entry = SessionEntry {
            outbound,
            display_name: profile.display_name,
            grid: profile.grid,
            fish: Vec::new(),
        };

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.epoch.as_mut() {
            None => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.epoch = Some(self.start_epoch(generation, id, &entry));
            }
            Some(epoch) => match epoch.capability {
                Some(capability) => {
                    epoch.spawn_fish(id, &mut entry, self.shared.config.fish_per_session, &capability);
                    if epoch.floor_rendered {
                        let mut floor = RenderBuffer::new();
                        render_floor(&mut floor, &capability, epoch.floor_tile);
                        if let Err(e) = entry.outbound.try_send(floor.into_bytes()) {
                            debug!("{} floor not queued: {}", id, e);
                        }
                    }
                }
                None => debug!("{} waits for negotiation before spawning", id),
            },
        }

        info!("{} ({}) joined, {} sessions", id, entry.display_name, state.sessions.len() + 1);
        state.sessions.insert(id, entry);
        self.shared.metrics.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.publish_counts(state);
        id
    }

    /// Tear a session down. Safe to call more than once; later calls do nothing.
    pub fn unregister(&self, id: SessionId) {
        let (entry, departure, remaining, ended) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let Some(entry) = state.sessions.remove(&id) else {
                debug!("{} already unregistered", id);
                return;
            };

            let mut departure = RenderBuffer::new();
            if let Some(epoch) = state.epoch.as_mut() {
                for fish_id in &entry.fish {
                    let Some(fish) = epoch.fishes.remove(fish_id) else {
                        continue;
                    };
                    if let Some(capability) = epoch.capability {
                        let poof = render_departure(&mut departure, &fish, &capability);
                        epoch.poofs.push(poof);
                    }
                }
                if epoch.negotiation.as_ref().is_some_and(|n| n.target == id) {
                    epoch.negotiation = None;
                }
            }

            let ended = if state.sessions.is_empty() {
                state.epoch.take()
            } else {
                None
            };
            let remaining = Self::outbounds(state);
            self.publish_counts(state);
            (entry, departure, remaining, ended)
        };

        if let Err(e) = entry.outbound.finish(Bytes::from_static(TEARDOWN)) {
            debug!("{} teardown not queued: {}", id, e);
        }
        info!("{} ({}) left, {} sessions", id, entry.display_name, remaining.len());
        drop(entry);

        self.broadcast(departure.into_bytes(), &remaining);
        if let Some(epoch) = ended {
            self.end_epoch(epoch);
        }
    }

    /// Decode inbound bytes and act on every complete event.
    /// Returns `false` once the session asked to disconnect.
    pub fn route_input(&self, id: SessionId, decoder: &mut InputDecoder, bytes: &[u8]) -> bool {
        decoder.feed(bytes).into_iter().all(|event| self.dispatch(id, event))
    }

    /// Act on one decoded event; `false` means the session is gone
    pub fn dispatch(&self, id: SessionId, event: InputEvent) -> bool {
        let pointer = match event {
            InputEvent::Disconnect => {
                debug!("{} requested disconnect", id);
                self.unregister(id);
                return false;
            }
            InputEvent::PixelSize(report) => {
                let mut guard = self.shared.state.lock();
                let state = &mut *guard;
                if !state.sessions.contains_key(&id) {
                    return false;
                }
                let pending = state
                    .epoch
                    .as_mut()
                    .filter(|epoch| epoch.negotiation.as_ref().is_some_and(|n| n.target == id))
                    .and_then(|epoch| epoch.negotiation.take());
                match pending {
                    Some(negotiation) => {
                        let _ = negotiation.reports.send(report);
                    }
                    None => debug!("Ignoring unsolicited pixel report from {}", id),
                }
                return true;
            }
            InputEvent::Pointer(pointer) => pointer,
        };

        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if !state.sessions.contains_key(&id) {
            return false;
        }
        let Some(epoch) = state.epoch.as_mut() else {
            return true;
        };
        let Some(capability) = epoch.capability else {
            return true;
        };
        match handle_click(&mut epoch.fishes, &capability, id, pointer, &mut rand::thread_rng()) {
            ClickOutcome::Nudged { fish, angle } => {
                self.shared.metrics.clicks.fetch_add(1, Ordering::Relaxed);
                debug!("{} turned fish {} by {} degrees", id, fish, angle);
            }
            ClickOutcome::NotOwner(fish) => debug!("{} clicked fish {} it does not own", id, fish),
            ClickOutcome::Missed | ClickOutcome::Ignored => {}
        }
        true
    }

    /// One scheduler step using the wall-clock time since the previous one
    pub fn tick(&self) {
        self.step(None, None);
    }

    /// One scheduler step with an explicit `dt` in seconds
    pub fn advance(&self, dt: f32) {
        self.step(None, Some(dt));
    }

    fn step(&self, generation: Option<u64>, dt: Option<f32>) {
        let started = std::time::Instant::now();
        let now = Instant::now();

        let (frame, targets) = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let Some(epoch) = state.epoch.as_mut() else {
                return;
            };
            if generation.is_some_and(|g| g != epoch.generation) {
                return;
            }
            let elapsed = now.duration_since(epoch.last_tick).as_secs_f32();
            epoch.last_tick = now;
            let Some(capability) = epoch.capability else {
                return;
            };

            let dt = dt.unwrap_or(elapsed).clamp(0.0, timing::MAX_DT);
            physics::update(&mut epoch.fishes, &capability, dt);
            let frame = epoch.render(&capability, now);
            (frame, Self::outbounds(state))
        };

        self.broadcast(frame, &targets);
        self.shared.metrics.record_tick_time(started.elapsed());
    }

    pub fn current_entity_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .epoch
            .as_ref()
            .map_or(0, |epoch| epoch.fishes.len())
    }

    pub fn session_count(&self) -> usize {
        self.shared.state.lock().sessions.len()
    }

    pub fn capability(&self) -> Option<TerminalCapability> {
        self.shared.state.lock().epoch.as_ref().and_then(|e| e.capability)
    }

    pub fn epoch_generation(&self) -> Option<u64> {
        self.shared.state.lock().epoch.as_ref().map(|e| e.generation)
    }

    /// Stop the scheduler and close every session
    pub async fn shutdown(&self) {
        let (epoch, sessions) = {
            let mut state = self.shared.state.lock();
            let sessions: Vec<(SessionId, SessionEntry)> = state.sessions.drain().collect();
            let epoch = state.epoch.take();
            self.publish_counts(&state);
            (epoch, sessions)
        };

        for (id, entry) in sessions {
            if let Err(e) = entry.outbound.finish(Bytes::from_static(TEARDOWN)) {
                debug!("{} teardown not queued: {}", id, e);
            }
        }

        if let Some(mut epoch) = epoch {
            epoch.cancel.cancel();
            if let Some(handle) = epoch.scheduler.take() {
                stop_scheduler(epoch.generation, handle).await;
            }
        }
        info!("Aquarium manager stopped");
    }

    fn spawn_outbound(&self, id: SessionId, sink: Arc<dyn SessionSink>) -> Outbound {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        Outbound::spawn(
            sink,
            self.shared.config.outbound_queue,
            self.shared.config.write_timeout,
            move |e| {
                warn!("Write to {} failed: {}, tearing it down", id, e);
                if let Some(shared) = shared.upgrade() {
                    AquariumManager { shared }.unregister(id);
                }
            },
        )
    }

    fn start_epoch(&self, generation: u64, target: SessionId, entry: &SessionEntry) -> Epoch {
        let cancel = CancellationToken::new();
        let scheduler = self.spawn_scheduler(generation, cancel.clone());

        let (reports, rx) = oneshot::channel();
        self.spawn_negotiation(generation, entry.outbound.clone(), entry.grid, rx, cancel.clone());

        let floor_tile = rand::thread_rng().gen_range(0..chrome::FLOOR_TILE_COUNT);
        self.shared.metrics.epochs_started.fetch_add(1, Ordering::Relaxed);
        info!("Epoch {} started by {} with floor tile {}", generation, target, floor_tile);

        let now = Instant::now();
        Epoch {
            generation,
            started: now,
            last_tick: now,
            capability: None,
            fishes: HashMap::new(),
            next_fish_id: 1,
            floor_tile,
            floor_rendered: false,
            last_status: None,
            poofs: Vec::new(),
            cancel,
            scheduler: Some(scheduler),
            negotiation: Some(Negotiation { target, reports }),
        }
    }

    fn spawn_scheduler(&self, generation: u64, cancel: CancellationToken) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let period = self.shared.config.tick_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            debug!("Scheduler for epoch {} running every {:?}", generation, period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        AquariumManager { shared }.step(Some(generation), None);
                    }
                }
            }
            debug!("Scheduler for epoch {} stopped", generation);
        })
    }

    fn spawn_negotiation(
        &self,
        generation: u64,
        outbound: Outbound,
        grid: GridSize,
        reports: oneshot::Receiver<PixelReport>,
        cancel: CancellationToken,
    ) {
        let manager = self.clone();
        let timeout = self.shared.config.negotiation_timeout;
        tokio::spawn(async move {
            let result = negotiate(&outbound, grid, reports, timeout, cancel).await;
            drop(outbound);
            if let Some(capability) = result {
                manager.apply_capability(generation, capability);
            }
        });
    }

    /// Fix the epoch's capability and give every waiting session its fish
    fn apply_capability(&self, generation: u64, capability: TerminalCapability) {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let Some(epoch) = state.epoch.as_mut().filter(|e| e.generation == generation) else {
            debug!("Discarding capability for ended epoch {}", generation);
            return;
        };
        if epoch.capability.is_some() {
            return;
        }
        epoch.capability = Some(capability);
        epoch.negotiation = None;

        let counter = if capability == TerminalCapability::DEFAULT {
            &self.shared.metrics.negotiations_defaulted
        } else {
            &self.shared.metrics.negotiations_reported
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut waiting: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, entry)| entry.fish.is_empty())
            .map(|(id, _)| *id)
            .collect();
        waiting.sort();
        for id in waiting {
            if let Some(entry) = state.sessions.get_mut(&id) {
                epoch.spawn_fish(id, entry, self.shared.config.fish_per_session, &capability);
            }
        }

        info!(
            "Epoch {} capability {}x{} cells of {}x{} px",
            generation, capability.columns, capability.rows, capability.cell_width, capability.cell_height
        );
        let fish = epoch.fishes.len();
        self.shared.metrics.fish_count.store(fish as u64, Ordering::Relaxed);
    }

    fn end_epoch(&self, mut epoch: Epoch) {
        epoch.cancel.cancel();
        if let Some(handle) = epoch.scheduler.take() {
            tokio::spawn(stop_scheduler(epoch.generation, handle));
        }
        info!(
            "Epoch {} ended after {:?}",
            epoch.generation,
            Instant::now().duration_since(epoch.started)
        );
    }

    fn outbounds(state: &RegistryState) -> Vec<(SessionId, Outbound)> {
        state
            .sessions
            .iter()
            .map(|(id, entry)| (*id, entry.outbound.clone()))
            .collect()
    }

    /// Queue a frame on every target; a full queue loses this frame only
    fn broadcast(&self, frame: Bytes, targets: &[(SessionId, Outbound)]) {
        if frame.is_empty() {
            return;
        }
        let metrics = &self.shared.metrics;
        for (id, outbound) in targets {
            match outbound.try_send(frame.clone()) {
                Ok(()) => {
                    metrics.bytes_broadcast.fetch_add(frame.len() as u64, Ordering::Relaxed);
                }
                Err(QueueError::Full) => {
                    metrics.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("{} queue full, dropping frame", id);
                }
                Err(QueueError::Closed) => debug!("{} queue closed, teardown pending", id),
            }
        }
    }

    fn publish_counts(&self, state: &RegistryState) {
        let metrics = &self.shared.metrics;
        metrics.sessions_active.store(state.sessions.len() as u64, Ordering::Relaxed);
        let fish = state.epoch.as_ref().map_or(0, |e| e.fishes.len());
        metrics.fish_count.store(fish as u64, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn fish_of(&self, id: SessionId) -> Vec<FishId> {
        self.shared
            .state
            .lock()
            .sessions
            .get(&id)
            .map(|s| s.fish.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn with_fish<T>(&self, id: FishId, f: impl FnOnce(&mut Fish) -> T) -> Option<T> {
        let mut state = self.shared.state.lock();
        state.epoch.as_mut()?.fishes.get_mut(&id).map(f)
    }
}

/// Wait for an epoch's scheduler to finish, aborting it after the deadline
async fn stop_scheduler(generation: u64, handle: JoinHandle<()>) {
    let abort = handle.abort_handle();
    let deadline = Duration::from_millis(timing::SCHEDULER_STOP_TIMEOUT_MS);
    match tokio::time::timeout(deadline, handle).await {
        Ok(Ok(())) => debug!("Scheduler for epoch {} joined", generation),
        Ok(Err(e)) => warn!("Scheduler for epoch {} failed: {}", generation, e),
        Err(_) => {
            warn!("Scheduler for epoch {} did not stop within {:?}, aborting", generation, deadline);
            abort.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::overlay::decode_frames;
    use crate::net::sink::testing::{settle, MemorySink};
    use crate::net::sink::SinkError;
    use crate::net::terminal::PIXEL_SIZE_QUERY;
    use crate::util::vec2::Vec2;
    use async_trait::async_trait;

    fn test_manager() -> AquariumManager {
        let config = EngineConfig {
            // Long enough that only explicit advance() calls render
            tick_interval: Duration::from_secs(3600),
            fish_per_session: 1,
            negotiation_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            outbound_queue: 64,
        };
        AquariumManager::new(config, Arc::new(SpriteAssets::placeholder()), Arc::new(Metrics::new()))
    }

    fn profile(name: &str, columns: u32, rows: u32) -> SessionProfile {
        SessionProfile {
            display_name: name.to_string(),
            grid: GridSize::new(columns, rows),
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    fn report(manager: &AquariumManager, id: SessionId) {
        let mut decoder = InputDecoder::new();
        assert!(manager.route_input(id, &mut decoder, b"\x1b[4;600;1000t"));
    }

    fn mouse_press(col: u8, row: u8) -> Vec<u8> {
        vec![0x1b, b'[', b'M', 32, col + 32, row + 32]
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_session_starts_epoch_and_negotiates() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let id = manager.register(sink.clone(), profile("ann", 100, 30));
        settle().await;

        let out = sink.bytes();
        assert!(out.starts_with(SETUP));
        assert!(contains(&out, b"a=t,f=100,i=1,"));
        assert!(contains(&out, PIXEL_SIZE_QUERY));
        assert_eq!(manager.epoch_generation(), Some(1));
        assert_eq!(manager.capability(), None);
        assert_eq!(manager.current_entity_count(), 0);

        report(&manager, id);
        settle().await;
        assert_eq!(
            manager.capability(),
            Some(TerminalCapability {
                columns: 100,
                rows: 30,
                cell_width: 10,
                cell_height: 20,
            })
        );
        assert_eq!(manager.current_entity_count(), 1);
        assert_eq!(manager.fish_of(id).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_terminal_gets_default_capability() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let id = manager.register(sink.clone(), profile("ann", 100, 30));
        settle().await;

        tokio::time::sleep(Duration::from_millis(2100)).await;
        settle().await;
        assert_eq!(manager.capability(), Some(TerminalCapability::DEFAULT));
        assert_eq!(manager.fish_of(id).len(), 1);

        // A late report changes nothing
        report(&manager, id);
        settle().await;
        assert_eq!(manager.capability(), Some(TerminalCapability::DEFAULT));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_session_reuses_capability() {
        let manager = test_manager();
        let first = MemorySink::new();
        let a = manager.register(first.clone(), profile("ann", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;

        let second = MemorySink::new();
        let b = manager.register(second.clone(), profile("bob", 80, 24));
        settle().await;
        assert_eq!(manager.fish_of(b).len(), 1);
        assert_eq!(manager.current_entity_count(), 2);
        assert!(!contains(&second.bytes(), PIXEL_SIZE_QUERY));
        assert_eq!(manager.capability().map(|c| c.cell_width), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_session_spawns_after_negotiation() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        settle().await;
        let b = manager.register(MemorySink::new(), profile("bob", 100, 30));
        settle().await;
        assert_eq!(manager.current_entity_count(), 0);

        report(&manager, a);
        settle().await;
        assert_eq!(manager.fish_of(a).len(), 1);
        assert_eq!(manager.fish_of(b).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiating_session_leaving_falls_back() {
        let manager = test_manager();
        let first = MemorySink::new();
        let a = manager.register(first.clone(), profile("ann", 100, 30));
        settle().await;
        let second = MemorySink::new();
        let b = manager.register(second.clone(), profile("bob", 100, 30));
        settle().await;

        manager.unregister(a);
        settle().await;

        assert_eq!(manager.capability(), Some(TerminalCapability::DEFAULT));
        assert_eq!(manager.fish_of(b).len(), 1);
        assert_eq!(manager.current_entity_count(), 1);
        assert!(!contains(&second.bytes(), PIXEL_SIZE_QUERY));
        assert!(first.bytes().ends_with(TEARDOWN));
        assert!(first.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_aquarium_resets_epoch() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;
        assert_eq!(manager.current_entity_count(), 1);

        manager.unregister(a);
        settle().await;
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.epoch_generation(), None);
        assert_eq!(manager.capability(), None);
        assert_eq!(manager.current_entity_count(), 0);

        let sink = MemorySink::new();
        manager.register(sink.clone(), profile("bob", 80, 24));
        settle().await;
        assert_eq!(manager.epoch_generation(), Some(2));
        assert_eq!(manager.capability(), None);
        assert!(contains(&sink.bytes(), PIXEL_SIZE_QUERY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_is_idempotent() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let keep = manager.register(MemorySink::new(), profile("keep", 80, 24));
        let id = manager.register(sink.clone(), profile("ann", 80, 24));
        settle().await;

        manager.unregister(id);
        manager.unregister(id);
        settle().await;
        assert_eq!(manager.session_count(), 1);
        assert_eq!(sink.text().matches("Aquarium session ended").count(), 1);

        manager.unregister(keep);
        manager.unregister(keep);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_broadcasts_poof_then_deletion() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        let watcher = MemorySink::new();
        manager.register(watcher.clone(), profile("bob", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;
        manager.advance(1.0 / 30.0);
        settle().await;

        let fish = manager.fish_of(a)[0];
        watcher.take();
        manager.unregister(a);
        settle().await;

        let out = watcher.bytes();
        let frames = decode_frames(&out).unwrap();
        let deletion = frames
            .iter()
            .find(|f| f.action() == Some("d"))
            .expect("placement deletion broadcast");
        assert_eq!(deletion.get("p"), Some(fish.to_string().as_str()));

        let text = String::from_utf8_lossy(&out);
        let poof = text.find('*').expect("poof glyph");
        let delete = text.find("a=d").unwrap();
        assert!(poof < delete);
        assert_eq!(manager.current_entity_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_renders_to_every_session() {
        let manager = test_manager();
        let first = MemorySink::new();
        let second = MemorySink::new();
        let a = manager.register(first.clone(), profile("ann", 100, 30));
        let b = manager.register(second.clone(), profile("bob", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;
        first.take();
        second.take();

        manager.advance(1.0 / 30.0);
        settle().await;
        for sink in [&first, &second] {
            let out = sink.bytes();
            let frames = decode_frames(&out).unwrap();
            for id in [manager.fish_of(a)[0], manager.fish_of(b)[0]] {
                let pid = id.to_string();
                assert!(frames
                    .iter()
                    .any(|f| f.action() == Some("p") && f.get("p") == Some(pid.as_str())));
            }
            assert!(frames.iter().any(|f| f.get("p") == Some("1000")));
            assert!(contains(&out, b"\x1b[30;1H\x1b[2K"));
        }

        // Floor once per epoch, status once per second
        first.take();
        manager.advance(1.0 / 30.0);
        settle().await;
        let out = first.bytes();
        assert!(!decode_frames(&out).unwrap().iter().any(|f| f.get("p") == Some("1000")));
        assert!(!contains(&out, b"\x1b[2K"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        first.take();
        manager.advance(1.0 / 30.0);
        settle().await;
        assert!(contains(&first.bytes(), b"\x1b[2K"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_gets_floor() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;
        manager.advance(1.0 / 30.0);

        let late = MemorySink::new();
        manager.register(late.clone(), profile("bob", 100, 30));
        settle().await;
        let frames = decode_frames(&late.bytes()).unwrap();
        assert!(frames.iter().any(|f| f.get("p") == Some("1000")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clicks_are_owner_gated() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        let b = manager.register(MemorySink::new(), profile("bob", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;

        let fish_a = manager.fish_of(a)[0];
        let fish_b = manager.fish_of(b)[0];
        manager.with_fish(fish_a, |f| {
            f.position = Vec2::new(100.0, 100.0);
            f.velocity = Vec2::new(50.0, 0.0);
            f.bob_phase = 0.5;
            f.bubbles.clear();
        });
        manager.with_fish(fish_b, |f| f.position = Vec2::new(800.0, 400.0));

        // Cell (11, 6) starts at pixel (100, 100) with 10x20 cells
        let click = mouse_press(11, 6);

        let mut decoder_b = InputDecoder::new();
        assert!(manager.route_input(b, &mut decoder_b, &click));
        let (velocity, bubbles) = manager
            .with_fish(fish_a, |f| (f.velocity, f.bubbles.len()))
            .unwrap();
        assert_eq!(velocity, Vec2::new(50.0, 0.0));
        assert_eq!(bubbles, 0);

        let mut decoder_a = InputDecoder::new();
        assert!(manager.route_input(a, &mut decoder_a, &click));
        let (velocity, bubbles) = manager
            .with_fish(fish_a, |f| (f.velocity, f.bubbles.len()))
            .unwrap();
        assert_eq!(bubbles, 3);
        assert!((velocity.length() - 50.0).abs() < 1e-3);
        assert!(!velocity.approx_eq(Vec2::new(50.0, 0.0), 1e-3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_key_tears_down() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let id = manager.register(sink.clone(), profile("ann", 80, 24));
        settle().await;

        let mut decoder = InputDecoder::new();
        assert!(!manager.route_input(id, &mut decoder, b"q"));
        settle().await;
        assert_eq!(manager.session_count(), 0);
        assert!(sink.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_from_departed_session_stops_reader() {
        let manager = test_manager();
        let a = manager.register(MemorySink::new(), profile("ann", 100, 30));
        settle().await;
        manager.unregister(a);
        settle().await;

        let report = InputEvent::PixelSize(PixelReport {
            width: 1000,
            height: 600,
        });
        assert!(!manager.dispatch(a, report));
        let mut decoder = InputDecoder::new();
        assert!(!manager.route_input(a, &mut decoder, b"\x1b[4;600;1000t"));
        assert!(!manager.route_input(a, &mut decoder, &mouse_press(1, 1)));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cell_report_falls_back() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let id = manager.register(sink.clone(), profile("ann", 2, 1));
        settle().await;

        let mut decoder = InputDecoder::new();
        assert!(manager.route_input(id, &mut decoder, b"\x1b[4;16;4294967295t"));
        settle().await;
        assert_eq!(manager.capability(), Some(TerminalCapability::DEFAULT));
        assert_eq!(manager.fish_of(id).len(), 1);

        manager.advance(1.0 / 30.0);
        assert!(manager.route_input(id, &mut decoder, &mouse_press(1, 1)));
        assert_eq!(manager.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_unregisters_session() {
        let manager = test_manager();
        manager.register(MemorySink::new(), profile("ann", 80, 24));
        let broken = MemorySink::new();
        broken.fail_writes();
        manager.register(broken, profile("bob", 80, 24));
        settle().await;
        assert_eq!(manager.session_count(), 1);
    }

    /// Sink that accepts one write and then never completes another
    struct StuckSink;

    #[async_trait]
    impl SessionSink for StuckSink {
        async fn write(&self, _data: Bytes) -> Result<(), SinkError> {
            std::future::pending().await
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_session_does_not_block_others() {
        let manager = test_manager();
        let a = manager.register(Arc::new(StuckSink), profile("slow", 100, 30));
        let healthy = MemorySink::new();
        manager.register(healthy.clone(), profile("fast", 100, 30));
        settle().await;
        report(&manager, a);
        settle().await;

        let before = healthy.write_count();
        for _ in 0..200 {
            manager.advance(1.0 / 30.0);
            settle().await;
        }
        assert!(healthy.write_count() >= before + 200);
        assert!(manager.metrics().frames_dropped.load(Ordering::Relaxed) > 0);
        assert_eq!(manager.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        let manager = test_manager();
        let sink = MemorySink::new();
        let id = manager.register(sink.clone(), profile("ann", 80, 24));
        settle().await;
        report(&manager, id);
        settle().await;

        manager.shutdown().await;
        settle().await;
        assert_eq!(manager.session_count(), 0);
        assert_eq!(manager.epoch_generation(), None);
        assert!(sink.is_closed());
        assert!(sink.bytes().ends_with(TEARDOWN));
    }
}
