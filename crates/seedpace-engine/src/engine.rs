//! The limit engine: tick loop, batched cap application, lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use seedpace_client::{ClientAdapter, TorrentSummary};
use seedpace_config::{ConfigService, RulesSnapshot};
use seedpace_control::{CalcInput, Phase, PrecisionBias, safe_div};
use seedpace_events::{CycleGrade, Event, EventBus};
use seedpace_site::SiteRegistry;
use seedpace_store::{CycleRecord, EngineSnapshot, HistoryStore, StateStore};

use crate::budget::RpcBudget;
use crate::dl_limit::{DlDecision, calc_dl_cap};
use crate::notify::{
    self, COOKIE_INTERVAL, DL_LIMIT_INTERVAL, NotificationGate, OVERSPEED_INTERVAL,
};
use crate::reannounce::{ReannounceDecision, check_waiting, should_reannounce};
use crate::state::{TimeLeftSource, TorrentState};
use crate::status::{EngineStats, EngineStatus, TorrentView};
use crate::{
    MIN_LIMIT, PEER_LIST_CHECK_INTERVAL, PROGRESS_PROTECT, REANNOUNCE_WAIT_LIMIT_KIB,
    TID_SEARCH_INTERVAL, UNKNOWN_TIME_LEFT, unix_now,
};

const WORKER_QUEUE_CAPACITY: usize = 2_000;
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_SLEEP: f64 = 0.1;

/// Everything the engine needs from the outside.
pub struct EngineDeps {
    /// Client RPC binding.
    pub client: Arc<dyn ClientAdapter>,
    /// Site adapters, possibly empty.
    pub sites: SiteRegistry,
    /// Rule/site configuration source.
    pub config: Arc<ConfigService>,
    /// Durable engine state.
    pub store: StateStore,
    /// Cycle-history append log.
    pub history: HistoryStore,
    /// Notification sink.
    pub events: EventBus,
}

pub(crate) struct Counters {
    total_cycles: AtomicU64,
    success_cycles: AtomicU64,
    precision_cycles: AtomicU64,
    total_limit_uploaded: AtomicU64,
    started_at_bits: AtomicU64,
}

impl Counters {
    fn started_at(&self) -> f64 {
        f64::from_bits(self.started_at_bits.load(Ordering::Relaxed))
    }
}

/// State shared between the tick loop, the workers, and the control surface.
pub(crate) struct Shared {
    pub(crate) states: Mutex<HashMap<String, TorrentState>>,
    pub(crate) bias: Mutex<PrecisionBias>,
    pub(crate) gate: Mutex<NotificationGate>,
    pub(crate) counters: Counters,
    budget: Mutex<RpcBudget>,
    controlled: AtomicUsize,
    paused: AtomicBool,
    running: AtomicBool,
    stop_flag: AtomicBool,
    stop_notify: Notify,
    temp_target_kib: Mutex<Option<i64>>,
    tid_tx: Mutex<Option<mpsc::Sender<String>>>,
    peer_tx: Mutex<Option<mpsc::Sender<String>>>,
    opaque: Mutex<std::collections::BTreeMap<String, serde_json::Value>>,
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct TickOutcome {
    time_left: f64,
    up_change: Option<i64>,
    dl_change: Option<i64>,
}

/// The precision average-speed limit engine.
///
/// Construct with [`LimitEngine::new`], then either [`LimitEngine::start`]
/// the background loop or drive [`LimitEngine::run_tick`] directly with a
/// simulated clock.
pub struct LimitEngine {
    client: Arc<dyn ClientAdapter>,
    sites: SiteRegistry,
    config: Arc<ConfigService>,
    store: StateStore,
    history: HistoryStore,
    events: EventBus,
    shared: Arc<Shared>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LimitEngine {
    /// Build an engine, loading persisted state anchored at the current time.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory cannot be created. A
    /// corrupt state file is logged and replaced with empty state.
    pub fn new(deps: EngineDeps) -> Result<Self> {
        Self::new_at(deps, unix_now())
    }

    /// Build an engine, loading persisted state anchored at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error when the state directory cannot be created.
    pub fn new_at(deps: EngineDeps, now: f64) -> Result<Self> {
        deps.store.ensure_initialized()?;
        let persisted = match deps.store.load() {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(error = %error, "state load failed; starting empty");
                EngineSnapshot::default()
            }
        };

        let tuning = deps.config.snapshot(now).settings.tuning.clone();
        let mut states = HashMap::with_capacity(persisted.torrents.len());
        for (hash, record) in &persisted.torrents {
            states.insert(
                hash.clone(),
                TorrentState::restore(hash.clone(), record, &tuning, now),
            );
        }
        if !states.is_empty() {
            info!(torrents = states.len(), "restored persisted torrent state");
        }

        let started_at = if persisted.counters.started_at > 0.0 {
            persisted.counters.started_at
        } else {
            now
        };

        let shared = Arc::new(Shared {
            states: Mutex::new(states),
            bias: Mutex::new(persisted.bias),
            gate: Mutex::new(NotificationGate::new()),
            counters: Counters {
                total_cycles: AtomicU64::new(persisted.counters.total_cycles),
                success_cycles: AtomicU64::new(persisted.counters.success_cycles),
                precision_cycles: AtomicU64::new(persisted.counters.precision_cycles),
                total_limit_uploaded: AtomicU64::new(persisted.counters.total_limit_uploaded),
                started_at_bits: AtomicU64::new(started_at.to_bits()),
            },
            budget: Mutex::new(RpcBudget::new(
                deps.config.snapshot(now).settings.api_rate_limit,
            )),
            controlled: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            stop_notify: Notify::new(),
            temp_target_kib: Mutex::new(None),
            tid_tx: Mutex::new(None),
            peer_tx: Mutex::new(None),
            opaque: Mutex::new(persisted.opaque),
        });

        Ok(Self {
            client: deps.client,
            sites: deps.sites,
            config: deps.config,
            store: deps.store,
            history: deps.history,
            events: deps.events,
            shared,
            loop_handle: Mutex::new(None),
            worker_handles: Mutex::new(Vec::new()),
        })
    }

    /// Whether the tick loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Whether control is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    /// Pause control: every torrent's cap is lifted on the next tick.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        info!("limit engine paused");
    }

    /// Resume control after a pause.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        info!("limit engine resumed");
    }

    /// Override every rule's target until restart; `None` clears.
    pub fn set_temp_target(&self, kib: Option<i64>) {
        *lock(&self.shared.temp_target_kib) = kib;
        info!(target_kib = ?kib, "temporary target override updated");
    }

    /// Start the tick loop and the background workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine is shutting down concurrently. Workers
    /// started before a failure are rolled back.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.stop_flag.store(false, Ordering::SeqCst);

        if !self.sites.is_empty() {
            let (tid_tx, tid_rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
            let (peer_tx, peer_rx) = mpsc::channel(WORKER_QUEUE_CAPACITY);
            *lock(&self.shared.tid_tx) = Some(tid_tx);
            *lock(&self.shared.peer_tx) = Some(peer_tx);
            let mut handles = lock(&self.worker_handles);
            handles.push(crate::workers::spawn_tid_worker(
                Arc::clone(&self.shared),
                self.sites.clone(),
                tid_rx,
            ));
            handles.push(crate::workers::spawn_peer_worker(
                Arc::clone(&self.shared),
                self.sites.clone(),
                peer_rx,
            ));
        }

        let engine = Arc::clone(self);
        *lock(&self.loop_handle) = Some(tokio::spawn(async move {
            engine.run_loop().await;
        }));

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.notify_startup().await;
        });

        info!("limit engine started");
        Ok(())
    }

    /// Stop the loop, restore limits, persist, and emit the shutdown event.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        self.shared.stop_notify.notify_waiters();

        let handle = lock(&self.loop_handle).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("tick loop did not stop in time");
            }
        }

        *lock(&self.shared.tid_tx) = None;
        *lock(&self.shared.peer_tx) = None;
        let workers = std::mem::take(&mut *lock(&self.worker_handles));
        for handle in workers {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                debug!("site worker did not drain in time");
            }
        }

        self.restore_limits_on_exit().await;
        self.persist(unix_now());

        let counters = &self.shared.counters;
        self.events.publish(Event::Shutdown {
            total_cycles: counters.total_cycles.load(Ordering::Relaxed),
            success_cycles: counters.success_cycles.load(Ordering::Relaxed),
            precision_cycles: counters.precision_cycles.load(Ordering::Relaxed),
            total_limit_uploaded: counters.total_limit_uploaded.load(Ordering::Relaxed),
        });
        info!("limit engine stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut last_save = unix_now();
        let mut last_cookie_check = 0.0_f64;
        while !self.shared.stop_flag.load(Ordering::Relaxed) {
            let pass_started = std::time::Instant::now();
            let now = unix_now();

            let min_tl = self.run_tick(now).await;

            let settings = self.config.snapshot(now).settings.clone();
            if now - last_save >= settings.save_interval {
                self.persist(now);
                lock(&self.shared.gate).prune(now);
                last_save = now;
            }
            if now - last_cookie_check >= settings.cookie_check_interval {
                self.check_cookies(now).await;
                last_cookie_check = now;
            }

            let budget = sleep_budget(min_tl) - pass_started.elapsed().as_secs_f64();
            let sleep = Duration::from_secs_f64(budget.max(MIN_SLEEP));
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = self.shared.stop_notify.notified() => break,
            }
        }
    }

    /// One full pass over every connected client. Returns the smallest
    /// announce countdown seen, which drives the loop's sleep.
    pub async fn run_tick(&self, now: f64) -> f64 {
        let snapshot = self.config.snapshot(now);
        let mut min_tl = UNKNOWN_TIME_LEFT;
        let mut controlled = 0usize;
        let mut active: HashSet<String> = HashSet::new();
        let mut up_actions: HashMap<(u32, i64), Vec<String>> = HashMap::new();
        let mut dl_actions: HashMap<(u32, i64), Vec<String>> = HashMap::new();

        let instances = self.client.instances().await;
        for instance in instances.iter().filter(|instance| instance.connected) {
            let torrents = match self.client.active_torrents(instance.id).await {
                Ok(torrents) => torrents,
                Err(error) => {
                    debug!(client_id = instance.id, error = %error, "torrent list failed; skipping instance this tick");
                    continue;
                }
            };

            for torrent in &torrents {
                if torrent.hash.len() != 40 {
                    continue;
                }
                let Some(outcome) = self
                    .process_torrent(now, &snapshot, instance.id, torrent)
                    .await
                else {
                    continue;
                };

                active.insert(torrent.hash.clone());
                controlled += 1;
                min_tl = min_tl.min(outcome.time_left);

                if let Some(cap) = outcome.up_change {
                    up_actions
                        .entry((instance.id, cap))
                        .or_default()
                        .push(torrent.hash.clone());
                }
                if let Some(cap) = outcome.dl_change {
                    dl_actions
                        .entry((instance.id, cap))
                        .or_default()
                        .push(torrent.hash.clone());
                }
            }
        }

        for ((client_id, cap), hashes) in up_actions {
            debug!(client_id, cap, torrents = hashes.len(), "applying upload cap");
            if let Err(error) = self.client.set_upload_limit(client_id, &hashes, cap).await {
                debug!(client_id, error = %error, "upload cap apply failed; retrying next tick");
            }
        }
        for ((client_id, cap), hashes) in dl_actions {
            debug!(client_id, cap, torrents = hashes.len(), "applying download cap");
            if let Err(error) = self
                .client
                .set_download_limit(client_id, &hashes, cap)
                .await
            {
                debug!(client_id, error = %error, "download cap apply failed; retrying next tick");
            }
        }

        self.evict_stale(&active, now, snapshot.settings.evict_after);
        self.shared.controlled.store(controlled, Ordering::Relaxed);
        min_tl
    }

    #[allow(clippy::too_many_lines)]
    async fn process_torrent(
        &self,
        now: f64,
        snapshot: &Arc<RulesSnapshot>,
        client_id: u32,
        torrent: &TorrentSummary,
    ) -> Option<TickOutcome> {
        let hash = torrent.hash.clone();

        // First pass under the map lock: refresh identity, feed estimators,
        // decide whether the heavy properties RPC is due.
        let need_props = {
            let mut states = lock(&self.shared.states);
            let state = states
                .entry(hash.clone())
                .or_insert_with(|| TorrentState::new(&hash, &snapshot.settings.tuning));

            if state.client_id.is_some_and(|id| id != client_id) {
                // The torrent moved between clients: treat as new.
                debug!(hash = %hash, from = ?state.client_id, to = client_id, "torrent changed clients; re-seeding state");
                *state = TorrentState::new(&hash, &snapshot.settings.tuning);
            }
            state.client_id = Some(client_id);
            state.name.clone_from(&torrent.name);
            state.tracker.clone_from(&torrent.tracker);
            if torrent.total_size > 0 {
                state.total_size = torrent.total_size;
            }
            if torrent.added_on > 0.0 {
                state.added_at = torrent.added_on;
            }
            if state.session_start <= 0.0 {
                state.session_start = now;
                state.session_uploaded_at_start = torrent.uploaded;
                state.cache_timestamp = now;
            }
            state.last_seen = now;
            state.last_total_uploaded = torrent.uploaded;

            state.controller.record(now, torrent.upspeed);
            state.ring.record(now, torrent.upspeed, torrent.dlspeed);

            if state.site_id.is_none() {
                state.site_id = snapshot.match_site(&state.tracker);
            }

            self.maybe_enqueue_site_lookups(state, now);

            let cadence = props_cache_secs(state.phase(now));
            now - state.last_props >= cadence && lock(&self.shared.budget).allow(now)
        };

        let props = if need_props {
            self.client.properties(client_id, &hash).await.ok()
        } else {
            None
        };

        // Second pass under the map lock: the decision pipeline.
        let mut events: Vec<Event> = Vec::new();
        let mut reannounce_reason: Option<&'static str> = None;
        let outcome = {
            let mut states = lock(&self.shared.states);
            let state = states.get_mut(&hash)?;

            if let Some(props) = props {
                state.last_props = now;
                if TorrentState::time_left_valid(props.reannounce_in) {
                    state.cached_time_left = props.reannounce_in;
                    state.cache_timestamp = now;
                    state.time_left_source = TimeLeftSource::Client;
                }
            }

            let time_left = state.time_left(now);

            // Cycle boundary.
            let is_jump = state.cycle_start > 0.0 && time_left > state.prev_time_left + 30.0;
            if state.cycle_start <= 0.0 || is_jump {
                if is_jump {
                    self.report_cycle(state, torrent.uploaded, now, &mut events);
                }
                state.open_cycle(now, torrent.uploaded, time_left, is_jump);
            }
            state.prev_time_left = time_left;

            let rule = snapshot.rule_for(state.site_id);
            let Some(rule) = rule else {
                state.last_limit_reason = "no-rule".to_string();
                drop(states);
                for event in events {
                    self.events.publish(event);
                }
                return Some(TickOutcome {
                    time_left,
                    up_change: None,
                    dl_change: None,
                });
            };

            let target_kib = (*lock(&self.shared.temp_target_kib)).unwrap_or(rule.target_kib);
            state.target_bps = (target_kib as f64 * 1_024.0 * rule.safety_margin) as i64;

            self.maybe_notify_monitor_start(state, now, &mut events);

            let ceiling = snapshot.ceiling_bps(state.site_id);
            let site = state.site_id.and_then(|id| snapshot.site(id));
            let reannounce_enabled = site.is_some_and(|site| site.reannounce_opt);
            let dl_enabled = site.is_some_and(|site| site.dl_limit);

            if reannounce_enabled
                && let ReannounceDecision::Force(reason) =
                    check_waiting(state, torrent.uploaded, now, ceiling)
            {
                reannounce_reason = Some(reason);
            }

            let (cap, reason) =
                self.upload_cap(state, snapshot, torrent, time_left, now, &mut events);
            state.last_limit_reason.clone_from(&reason);
            let up_change = (cap != state.last_up_cap).then(|| {
                state.last_up_cap = cap;
                cap
            });

            let dl_change = if dl_enabled {
                self.download_cap(state, snapshot, torrent, now, ceiling, &mut events)
            } else {
                None
            };

            if reannounce_reason.is_none() && reannounce_enabled && !state.reannounced_this_cycle {
                match should_reannounce(
                    state,
                    torrent.downloaded,
                    torrent.uploaded,
                    torrent.total_size,
                    now,
                    &snapshot.settings,
                    ceiling,
                ) {
                    ReannounceDecision::Force(reason) => reannounce_reason = Some(reason),
                    ReannounceDecision::Wait => {
                        debug!(hash = %hash, "stalling upload until the optimal reannounce instant");
                    }
                    ReannounceDecision::None => {}
                }
            }

            Some(TickOutcome {
                time_left,
                up_change,
                dl_change,
            })
        };

        for event in events {
            self.events.publish(event);
        }

        if let Some(reason) = reannounce_reason {
            self.force_reannounce(client_id, &hash, reason, now).await;
        }

        outcome
    }

    /// The cap contract: safety brakes first, then the phase controller.
    fn upload_cap(
        &self,
        state: &mut TorrentState,
        snapshot: &RulesSnapshot,
        torrent: &TorrentSummary,
        time_left: f64,
        now: f64,
        events: &mut Vec<Event>,
    ) -> (i64, String) {
        if self.shared.paused.load(Ordering::Relaxed) {
            return (-1, "paused".to_string());
        }

        let ceiling = snapshot.ceiling_bps(state.site_id);
        let real_avg = state.real_avg_speed(torrent.uploaded, now);
        if real_avg > ceiling as f64 * 1.05 {
            if lock(&self.shared.gate).allow("overspeed", &state.hash, now, OVERSPEED_INTERVAL) {
                events.push(Event::OverspeedWarning {
                    hash: state.hash.clone(),
                    name: state.name.clone(),
                    real_avg_bps: real_avg,
                    ceiling_bps: ceiling,
                });
            }
            return (MIN_LIMIT, "overspeed-brake".to_string());
        }

        if state.waiting_reannounce {
            return (
                REANNOUNCE_WAIT_LIMIT_KIB * 1_024,
                "waiting-reannounce".to_string(),
            );
        }

        let elapsed = state.cycle_elapsed(now);
        let uploaded_in_cycle = state.cycle_uploaded(torrent.uploaded);
        let phase = state.phase_with(time_left);
        let bias_adj = lock(&self.shared.bias).adjustment(phase);

        let decision = state.controller.calculate(CalcInput {
            target_bps: state.target_bps as f64,
            uploaded: uploaded_in_cycle,
            time_left,
            elapsed,
            phase,
            now,
            bias_adj,
        });
        state.last_debug = decision.debug;
        let mut cap = decision.cap;
        let mut reason = decision.reason;

        if torrent.progress > PROGRESS_PROTECT && cap < 0 && time_left < 30.0 {
            cap = state.target_bps.max(MIN_LIMIT);
            reason.push_str("+protect");
        }

        (cap, reason)
    }

    fn download_cap(
        &self,
        state: &mut TorrentState,
        snapshot: &RulesSnapshot,
        torrent: &TorrentSummary,
        now: f64,
        ceiling: i64,
        events: &mut Vec<Event>,
    ) -> Option<i64> {
        let decision = calc_dl_cap(
            state,
            torrent.downloaded,
            torrent.uploaded,
            torrent.total_size,
            torrent.dlspeed,
            now,
            &snapshot.settings,
            ceiling,
        );

        match decision {
            DlDecision::NoChange => None,
            DlDecision::Release(reason) => {
                if state.last_dl_cap_kib <= 0 {
                    return None;
                }
                debug!(hash = %state.hash, reason, "releasing download cap");
                state.last_dl_cap_kib = -1;
                Some(-1)
            }
            DlDecision::Apply { cap_kib, reason } => {
                if cap_kib == state.last_dl_cap_kib {
                    return None;
                }
                state.last_dl_cap_kib = cap_kib;
                state.dl_limited_this_cycle = true;
                if lock(&self.shared.gate).allow("dl_limit", &state.hash, now, DL_LIMIT_INTERVAL) {
                    events.push(Event::DownloadLimitApplied {
                        hash: state.hash.clone(),
                        name: state.name.clone(),
                        cap_kib,
                        reason: reason.to_string(),
                    });
                }
                Some(cap_kib * 1_024)
            }
        }
    }

    fn maybe_notify_monitor_start(
        &self,
        state: &mut TorrentState,
        now: f64,
        events: &mut Vec<Event>,
    ) {
        if state.monitor_notified {
            return;
        }
        let has_helper = state
            .site_id
            .map_or_else(
                || self.sites.by_tracker(&state.tracker),
                |id| self.sites.by_id(id),
            )
            .is_some();
        let waited_out = now - state.session_start > 60.0;
        if state.tid_searched || !has_helper || waited_out {
            events.push(Event::MonitorStarted {
                hash: state.hash.clone(),
                name: state.name.clone(),
                total_size: state.total_size,
                target_bps: state.target_bps,
                tid: state.tid,
                promotion: state.promotion.clone(),
            });
            state.monitor_notified = true;
        }
    }

    fn maybe_enqueue_site_lookups(&self, state: &mut TorrentState, now: f64) {
        if self.sites.is_empty() {
            return;
        }
        let has_helper = state
            .site_id
            .map_or_else(
                || self.sites.by_tracker(&state.tracker),
                |id| self.sites.by_id(id),
            )
            .is_some();
        if !has_helper {
            return;
        }

        if state.tid.is_none()
            && !state.tid_searched
            && state.tid_not_found_until <= now
            && now - state.tid_search_time >= TID_SEARCH_INTERVAL
        {
            state.tid_search_time = now;
            if let Some(tx) = lock(&self.shared.tid_tx).as_ref()
                && tx.try_send(state.hash.clone()).is_err()
            {
                debug!(hash = %state.hash, "tid queue full; dropping lookup");
            }
        }

        if state.tid.is_some() && now - state.last_peer_check >= PEER_LIST_CHECK_INTERVAL {
            state.last_peer_check = now;
            if let Some(tx) = lock(&self.shared.peer_tx).as_ref()
                && tx.try_send(state.hash.clone()).is_err()
            {
                debug!(hash = %state.hash, "peerlist queue full; dropping lookup");
            }
        }
    }

    /// Close the books on a finished cycle: counters, bias, history, event.
    fn report_cycle(
        &self,
        state: &TorrentState,
        total_uploaded: u64,
        now: f64,
        events: &mut Vec<Event>,
    ) {
        let old_time_left = state.prev_time_left.max(0.0);
        let uploaded = state.cycle_uploaded(total_uploaded);
        let elapsed = state.cycle_elapsed(now);
        let total_time = (elapsed + old_time_left).max(1.0);
        let avg_bps = safe_div(uploaded as f64, total_time, 0.0);
        let ratio = if state.target_bps > 0 {
            avg_bps / state.target_bps as f64
        } else {
            0.0
        };
        let grade = CycleGrade::from_ratio(ratio);

        let counters = &self.shared.counters;
        counters.total_cycles.fetch_add(1, Ordering::Relaxed);
        counters
            .total_limit_uploaded
            .fetch_add(uploaded, Ordering::Relaxed);
        if grade != CycleGrade::Miss {
            counters.success_cycles.fetch_add(1, Ordering::Relaxed);
        }
        if grade == CycleGrade::Precise {
            counters.precision_cycles.fetch_add(1, Ordering::Relaxed);
        }

        // The synthetic first cycle would poison the learned bias.
        if !state.cycle_synthetic && state.target_bps > 0 {
            let phase = state.phase_with(old_time_left);
            lock(&self.shared.bias).record(ratio, phase);
        }

        let record = CycleRecord {
            hash: state.hash.clone(),
            name: state.name.clone(),
            client_id: state.client_id,
            cycle_index: state.cycle_index,
            cycle_start: state.cycle_start,
            cycle_end: now,
            uploaded,
            target_bps: state.target_bps,
            avg_bps,
            ratio,
            hit: grade != CycleGrade::Miss,
            informational: state.cycle_synthetic,
        };
        if let Err(error) = self.history.append(&record) {
            warn!(error = %error, "cycle history append failed");
        }

        info!(
            hash = %state.hash,
            cycle = state.cycle_index,
            uploaded,
            ratio,
            "cycle completed"
        );
        events.push(Event::CycleCompleted {
            hash: state.hash.clone(),
            name: state.name.clone(),
            client_id: state.client_id.unwrap_or(0),
            cycle_index: state.cycle_index,
            uploaded,
            target_bps: state.target_bps,
            avg_bps,
            ratio,
            grade,
        });
    }

    async fn force_reannounce(&self, client_id: u32, hash: &str, reason: &'static str, now: f64) {
        if let Err(error) = self.client.reannounce(client_id, hash).await {
            debug!(hash = %hash, error = %error, "forced reannounce failed");
            return;
        }

        let name = {
            let mut states = lock(&self.shared.states);
            let Some(state) = states.get_mut(hash) else {
                return;
            };
            state.last_reannounce = now;
            state.reannounced_this_cycle = true;
            state.waiting_reannounce = false;
            state.name.clone()
        };

        info!(hash = %hash, reason, "forced reannounce");
        if lock(&self.shared.gate).allow("reannounce", hash, now, notify::REANNOUNCE_INTERVAL) {
            self.events.publish(Event::ReannounceForced {
                hash: hash.to_string(),
                name,
                reason: reason.to_string(),
            });
        }
    }

    fn evict_stale(&self, active: &HashSet<String>, now: f64, evict_after: f64) {
        let mut states = lock(&self.shared.states);
        states.retain(|hash, state| {
            if active.contains(hash) {
                return true;
            }
            let keep = state.last_seen <= 0.0 || now - state.last_seen <= evict_after;
            if !keep {
                debug!(hash = %hash, "evicting stale torrent state");
            }
            keep
        });
    }

    async fn check_cookies(&self, now: f64) {
        let snapshot = self.config.snapshot(now);
        for adapter in self.sites.adapters() {
            match adapter.check_cookie().await {
                Ok(true) | Err(_) => {}
                Ok(false) => {
                    let site_id = adapter.site_id();
                    if lock(&self.shared.gate).allow(
                        "cookie",
                        &site_id.to_string(),
                        now,
                        COOKIE_INTERVAL,
                    ) {
                        let site_name = snapshot
                            .site(site_id)
                            .map_or_else(|| format!("site-{site_id}"), |site| site.name.clone());
                        warn!(site_id, site = %site_name, "site cookie no longer valid");
                        self.events.publish(Event::CookieInvalid { site_id, site_name });
                    }
                }
            }
        }
    }

    async fn notify_startup(&self) {
        let now = unix_now();
        let snapshot = self.config.snapshot(now);
        let rule = snapshot.default_rule().or_else(|| snapshot.rule_for(None));

        let mut client_versions = Vec::new();
        for instance in self.client.instances().await {
            if let Ok(version) = self.client.version(instance.id).await {
                client_versions.push(format!("{}:{version}", instance.name));
            }
        }

        self.events.publish(Event::Startup {
            target_kib: rule.map_or(0, |rule| rule.target_kib),
            safety_margin: rule.map_or(1.0, |rule| rule.safety_margin),
            reannounce_opt: snapshot.any_reannounce_opt,
            dl_limit: snapshot.any_dl_limit,
            client_versions,
            site_assist: !self.sites.is_empty(),
        });
    }

    /// Persist all durable state.
    pub fn persist(&self, now: f64) {
        let mut snapshot = EngineSnapshot {
            bias: lock(&self.shared.bias).clone(),
            opaque: lock(&self.shared.opaque).clone(),
            ..EngineSnapshot::default()
        };

        {
            let states = lock(&self.shared.states);
            for (hash, state) in states.iter() {
                snapshot.torrents.insert(hash.clone(), state.to_persisted());
            }
        }

        let counters = &self.shared.counters;
        snapshot.counters.total_cycles = counters.total_cycles.load(Ordering::Relaxed);
        snapshot.counters.success_cycles = counters.success_cycles.load(Ordering::Relaxed);
        snapshot.counters.precision_cycles = counters.precision_cycles.load(Ordering::Relaxed);
        snapshot.counters.total_limit_uploaded =
            counters.total_limit_uploaded.load(Ordering::Relaxed);
        snapshot.counters.started_at = counters.started_at();

        for site in self.config.snapshot(now).sites() {
            if !site.cookie.is_empty() {
                snapshot.cookies.insert(site.id, site.cookie.clone());
            }
        }

        if let Err(error) = self.store.save(&snapshot) {
            warn!(error = %error, "state persist failed; retrying on next interval");
        }
    }

    async fn restore_limits_on_exit(&self) {
        let mut by_client: HashMap<u32, Vec<String>> = HashMap::new();
        let mut by_client_dl: HashMap<u32, Vec<String>> = HashMap::new();
        {
            let states = lock(&self.shared.states);
            for (hash, state) in states.iter() {
                let Some(client_id) = state.client_id else {
                    continue;
                };
                if state.last_up_cap != -2 {
                    by_client.entry(client_id).or_default().push(hash.clone());
                }
                if state.last_dl_cap_kib > 0 {
                    by_client_dl
                        .entry(client_id)
                        .or_default()
                        .push(hash.clone());
                }
            }
        }

        for (client_id, hashes) in by_client {
            if let Err(error) = self.client.set_upload_limit(client_id, &hashes, -1).await {
                warn!(client_id, error = %error, "failed to lift upload caps on shutdown");
            }
        }
        for (client_id, hashes) in by_client_dl {
            if let Err(error) = self.client.set_download_limit(client_id, &hashes, -1).await {
                warn!(client_id, error = %error, "failed to lift download caps on shutdown");
            }
        }
    }

    /// Engine-level status snapshot at `now`.
    #[must_use]
    pub fn status(&self, now: f64) -> EngineStatus {
        let states = lock(&self.shared.states);
        let mut torrents: Vec<TorrentView> = states
            .values()
            .map(|state| TorrentView::from_state(state, now))
            .collect();
        torrents.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.hash.cmp(&b.hash)));
        EngineStatus {
            running: self.is_running(),
            paused: self.is_paused(),
            temp_target_kib: *lock(&self.shared.temp_target_kib),
            torrents,
        }
    }

    /// Detailed view of one torrent at `now`.
    #[must_use]
    pub fn state_view(&self, hash: &str, now: f64) -> Option<TorrentView> {
        let states = lock(&self.shared.states);
        states
            .get(hash)
            .map(|state| TorrentView::from_state(state, now))
    }

    /// Raw speed samples over the trailing window, for charting.
    #[must_use]
    pub fn samples(
        &self,
        hash: &str,
        window_secs: f64,
        now: f64,
    ) -> Option<Vec<seedpace_control::SpeedSample>> {
        let states = lock(&self.shared.states);
        states
            .get(hash)
            .map(|state| state.ring.samples_since(now, window_secs))
    }

    /// Recent completed-cycle records.
    #[must_use]
    pub fn recent_cycles(&self, limit: usize) -> Vec<CycleRecord> {
        self.history.recent(limit).unwrap_or_default()
    }

    /// Lifetime counters plus live gauges.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let counters = &self.shared.counters;
        EngineStats {
            total_cycles: counters.total_cycles.load(Ordering::Relaxed),
            success_cycles: counters.success_cycles.load(Ordering::Relaxed),
            precision_cycles: counters.precision_cycles.load(Ordering::Relaxed),
            total_limit_uploaded: counters.total_limit_uploaded.load(Ordering::Relaxed),
            started_at: counters.started_at(),
            controlled: self.shared.controlled.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }
}

/// Phase-bound refresh cadence for the heavy properties RPC, seconds.
const fn props_cache_secs(phase: Phase) -> f64 {
    match phase {
        Phase::Finish => 0.2,
        Phase::Steady => 0.5,
        Phase::Catch => 1.0,
        Phase::Warmup => 2.0,
    }
}

/// Dynamic tick period from the smallest announce countdown, seconds.
fn sleep_budget(min_tl: f64) -> f64 {
    if min_tl < 10.0 {
        0.15
    } else if min_tl < 60.0 {
        0.5
    } else if min_tl < 180.0 {
        1.0
    } else if min_tl < 600.0 {
        2.0
    } else if min_tl < 1_800.0 {
        4.0
    } else {
        5.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_budget_matches_countdown_bands() {
        assert_eq!(sleep_budget(5.0), 0.15);
        assert_eq!(sleep_budget(30.0), 0.5);
        assert_eq!(sleep_budget(100.0), 1.0);
        assert_eq!(sleep_budget(400.0), 2.0);
        assert_eq!(sleep_budget(1_000.0), 4.0);
        assert_eq!(sleep_budget(5_000.0), 5.0);
    }

    #[test]
    fn props_cadence_tightens_towards_finish() {
        assert!(props_cache_secs(Phase::Finish) < props_cache_secs(Phase::Steady));
        assert!(props_cache_secs(Phase::Steady) < props_cache_secs(Phase::Catch));
        assert!(props_cache_secs(Phase::Catch) < props_cache_secs(Phase::Warmup));
    }
}
