//! Dynamic wireless-channel allocation manager.
//!
//! One wildcard channel scans continuously for heart-rate monitors; devices
//! it discovers are promoted onto dedicated channels while capacity lasts,
//! with the least-recently-seen device evicted under pressure. Channels that
//! go quiet are reaped, and the wildcard is periodically rearmed to clear the
//! driver pathology where it latches onto already-tracked device numbers.
//!
//! Driver callbacks run on driver-owned threads and do nothing but decode the
//! payload and push an event onto a queue. A single consumer task owns every
//! piece of bookkeeping, so no lock is shared between the scheduling logic
//! and the callbacks; only the reading table itself is concurrent.

pub mod pool;
pub mod rearm;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use std::time::Duration;

use crate::ant;
use crate::config::{Config, ManagerConfig, RadioConfig};
use crate::radio::{BroadcastHandler, RadioChannel, RadioError, RadioNode};
use crate::readings::SharedReadingTable;
use pool::DedicatedPool;
use rearm::{RearmReason, RearmState};

/// Close/open attempts during an in-place rearm before falling back to a
/// full recreate.
const REARM_ATTEMPTS: u32 = 3;
const REARM_RETRY_BASE: Duration = Duration::from_millis(80);
const REARM_RETRY_STEP: Duration = Duration::from_millis(40);
/// Pause between closing and reconfiguring a channel being rearmed.
const SETTLE_AFTER_CLOSE: Duration = Duration::from_millis(60);
/// Pause after releasing a channel before recreating it from scratch.
const SETTLE_AFTER_RELEASE: Duration = Duration::from_millis(100);

/// Events consumed by the manager task.
enum Event {
    /// Extended broadcast heard on the wildcard channel.
    Wildcard { device_id: u16, heart_rate: u8 },
    /// Broadcast heard on a dedicated channel.
    Dedicated { device_id: u16, heart_rate: u8 },
    /// Reaper tick.
    Tick,
    Shutdown,
}

/// Result of a promotion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionOutcome {
    Promoted,
    Skipped,
    Failed,
}

/// Handle to a running manager; dropping it does not stop the daemon, call
/// [`ManagerHandle::stop`] for an orderly teardown.
pub struct ManagerHandle {
    events: mpsc::Sender<Event>,
    task: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

impl ManagerHandle {
    /// Shut the manager down: evict every dedicated channel, tear down the
    /// wildcard, stop the radio node.
    pub async fn stop(self) {
        self.ticker.abort();
        let _ = self.events.send(Event::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("manager task ended abnormally: {}", e);
        }
    }
}

/// Owns the radio node and all channel bookkeeping. Lives on its own task;
/// see [`ChannelManager::start`].
pub struct ChannelManager {
    config: ManagerConfig,
    radio_cfg: RadioConfig,
    node: Box<dyn RadioNode>,
    readings: SharedReadingTable,
    events_tx: mpsc::Sender<Event>,
    pool: DedicatedPool,
    rearm: RearmState,
    wildcard: Option<Box<dyn RadioChannel>>,
    restart_in_progress: bool,
}

impl ChannelManager {
    /// Configure the radio, open the wildcard channel, start the node, and
    /// spawn the manager and reaper tasks. Returns immediately.
    pub fn start(
        config: &Config,
        readings: SharedReadingTable,
        node: Box<dyn RadioNode>,
    ) -> anyhow::Result<ManagerHandle> {
        let key = config.radio.network_key_bytes()?;
        node.set_network_key(config.radio.network_number, &key)?;

        let (events_tx, events_rx) = mpsc::channel(config.manager.event_queue_depth);
        let capacity = config
            .manager
            .effective_max_dedicated(config.radio.hardware_channels);

        let mut manager = ChannelManager {
            config: config.manager.clone(),
            radio_cfg: config.radio.clone(),
            node,
            readings,
            events_tx: events_tx.clone(),
            pool: DedicatedPool::new(capacity, config.manager.promote_debounce()),
            rearm: RearmState::new(&config.manager),
            wildcard: None,
            restart_in_progress: false,
        };

        manager.open_wildcard()?;
        manager.node.start()?;
        info!(
            "radio node started, tracking up to {} dedicated devices",
            capacity
        );

        let task = tokio::spawn(manager.run(events_rx));

        let tick_tx = events_tx.clone();
        let interval = config.manager.reaper_interval();
        let ticker = tokio::spawn(async move {
            let mut ticks = time::interval(interval);
            ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if tick_tx.send(Event::Tick).await.is_err() {
                    break;
                }
            }
        });

        Ok(ManagerHandle {
            events: events_tx,
            task,
            ticker,
        })
    }

    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!(
            "channel manager running ({} dedicated slots)",
            self.pool.capacity()
        );
        while let Some(event) = events.recv().await {
            match event {
                Event::Wildcard {
                    device_id,
                    heart_rate,
                } => self.on_wildcard(device_id, heart_rate),
                Event::Dedicated {
                    device_id,
                    heart_rate,
                } => self.on_dedicated(device_id, heart_rate),
                Event::Tick => self.on_tick().await,
                Event::Shutdown => break,
            }
        }
        self.shutdown();
    }

    // ---------- wildcard observations ----------

    fn on_wildcard(&mut self, device_id: u16, heart_rate: u8) {
        let now = Instant::now();
        let already_dedicated = self.pool.is_dedicated(device_id);

        // A freshly rearmed scanner tends to re-report exactly the devices it
        // was rearmed to stop seeing; drop those while the window is open.
        if already_dedicated && self.rearm.in_ignore_window(now) {
            return;
        }

        self.readings.insert(device_id, heart_rate);
        self.pool.touch(device_id, now);

        if already_dedicated {
            let dedicated = self.pool.device_ids();
            if self.rearm.observe_dedicated(&dedicated, now) {
                info!(
                    "idle latch suspected, wildcard stuck on dedicated set {:?}",
                    dedicated
                );
            }
            return;
        }

        self.rearm.note_new_device(now);
        if self.promote(device_id, now) == PromotionOutcome::Promoted {
            self.rearm.reset_idle_latch();
            if self.rearm.request(RearmReason::Promoted, now) {
                debug!("rearm requested after promoting {}", device_id);
            }
        }
    }

    fn on_dedicated(&mut self, device_id: u16, heart_rate: u8) {
        self.readings.insert(device_id, heart_rate);
        self.pool.touch(device_id, Instant::now());
    }

    // ---------- promotion / eviction ----------

    fn promote(&mut self, device_id: u16, now: Instant) -> PromotionOutcome {
        if self.pool.is_dedicated(device_id) {
            return PromotionOutcome::Skipped;
        }
        if self.pool.debounced(device_id, now) {
            debug!("promotion of {} debounced", device_id);
            return PromotionOutcome::Skipped;
        }
        if !self.pool.begin_promotion(device_id) {
            return PromotionOutcome::Skipped;
        }
        self.pool.note_attempt(device_id, now);
        let outcome = self.promote_inner(device_id, now);
        self.pool.finish_promotion(device_id);
        outcome
    }

    fn promote_inner(&mut self, device_id: u16, now: Instant) -> PromotionOutcome {
        if self.pool.at_capacity() {
            // the candidate cannot be the device being promoted: it has no
            // pool entry yet
            if let Some(oldest) = self.pool.oldest() {
                self.evict(oldest, "capacity");
            }
        }

        let channel = match self.open_dedicated(device_id) {
            Ok(ch) => ch,
            Err(RadioError::NoFreeChannel) => {
                warn!(
                    "no free hardware channel for {}, staying wildcard-only",
                    device_id
                );
                return PromotionOutcome::Failed;
            }
            Err(e) => {
                error!("failed to open dedicated channel for {}: {}", device_id, e);
                return PromotionOutcome::Failed;
            }
        };

        match self.pool.insert(device_id, channel, now) {
            Ok(()) => {
                info!(
                    "dedicated channel open for {} ({}/{})",
                    device_id,
                    self.pool.len(),
                    self.pool.capacity()
                );
                PromotionOutcome::Promoted
            }
            Err(mut channel) => {
                // lost the capacity re-check at commit time
                warn!("pool full at commit, releasing channel for {}", device_id);
                Self::teardown_channel(channel.as_mut(), device_id);
                PromotionOutcome::Failed
            }
        }
    }

    fn open_dedicated(&self, device_id: u16) -> Result<Box<dyn RadioChannel>, RadioError> {
        let mut ch = self.node.new_channel()?;
        if let Err(e) = Self::configure_dedicated(&self.radio_cfg, device_id, ch.as_mut()) {
            Self::teardown_channel(ch.as_mut(), device_id);
            return Err(e);
        }
        ch.set_broadcast_handler(Self::dedicated_handler(self.events_tx.clone(), device_id));
        if let Err(e) = ch.open() {
            Self::teardown_channel(ch.as_mut(), device_id);
            return Err(e);
        }
        Ok(ch)
    }

    fn configure_dedicated(
        cfg: &RadioConfig,
        device_id: u16,
        ch: &mut dyn RadioChannel,
    ) -> Result<(), RadioError> {
        ch.set_period(cfg.period)?;
        ch.set_rf_freq(cfg.rf_freq)?;
        ch.set_id(device_id, cfg.device_type, 0)?;
        if let Err(e) = ch.enable_extended_messages(true) {
            debug!("extended messages unavailable on dedicated channel: {}", e);
        }
        Ok(())
    }

    fn evict(&mut self, device_id: u16, why: &str) {
        let Some(mut entry) = self.pool.remove(device_id) else {
            return;
        };
        self.readings.remove(device_id);
        Self::teardown_channel(entry.channel.as_mut(), device_id);
        info!("dedicated channel released for {} ({})", device_id, why);
    }

    /// Best-effort close + unassign; errors are logged, never propagated.
    fn teardown_channel(ch: &mut dyn RadioChannel, device_id: u16) {
        ch.clear_broadcast_handler();
        if let Err(e) = ch.close() {
            if e.is_transient() {
                debug!("closing channel for {}: {}", device_id, e);
            } else {
                error!("failed to close channel for {}: {}", device_id, e);
            }
        }
        if let Err(e) = ch.unassign() {
            debug!("failed to unassign channel for {}: {}", device_id, e);
        }
    }

    // ---------- wildcard lifecycle ----------

    fn open_wildcard(&mut self) -> Result<(), RadioError> {
        if self.wildcard.is_some() {
            return Ok(());
        }
        let mut ch = self.node.new_channel()?;
        if let Err(e) = Self::configure_wildcard(&self.radio_cfg, ch.as_mut()) {
            Self::teardown_channel(ch.as_mut(), ant::WILDCARD_DEVICE_ID);
            return Err(e);
        }
        ch.set_broadcast_handler(Self::wildcard_handler(self.events_tx.clone()));
        if let Err(e) = ch.open() {
            Self::teardown_channel(ch.as_mut(), ant::WILDCARD_DEVICE_ID);
            return Err(e);
        }
        self.wildcard = Some(ch);
        info!("wildcard channel open (continuous search)");
        Ok(())
    }

    fn configure_wildcard(cfg: &RadioConfig, ch: &mut dyn RadioChannel) -> Result<(), RadioError> {
        ch.set_rf_freq(cfg.rf_freq)?;
        ch.set_period(cfg.period)?;
        ch.set_id(ant::WILDCARD_DEVICE_ID, cfg.device_type, 0)?;
        // tolerated on sticks that lack them, same as the search timeout
        if let Err(e) = ch.enable_extended_messages(true) {
            debug!("extended messages not supported: {}", e);
        }
        if let Err(e) = ch.set_search_timeout(ant::SEARCH_TIMEOUT_INFINITE) {
            debug!("search timeout not supported: {}", e);
        }
        Ok(())
    }

    // ---------- rearm execution (reaper context only) ----------

    async fn execute_rearm(&mut self, reason: RearmReason) {
        if self.restart_in_progress {
            return;
        }
        self.restart_in_progress = true;
        let result = self.rearm_wildcard(reason).await;
        self.restart_in_progress = false;
        match result {
            Ok(()) => self.rearm.mark_rearmed(Instant::now()),
            Err(e) => error!("wildcard rearm failed ({}): {}", reason, e),
        }
    }

    async fn rearm_wildcard(&mut self, reason: RearmReason) -> Result<(), RadioError> {
        let Some(mut ch) = self.wildcard.take() else {
            self.open_wildcard()?;
            debug!("wildcard opened (reason: {})", reason);
            return Ok(());
        };

        // no events while the channel is torn down
        ch.clear_broadcast_handler();

        match Self::rearm_in_place(&self.radio_cfg, &self.events_tx, ch.as_mut()).await {
            Ok(()) => {
                self.wildcard = Some(ch);
                debug!("wildcard rearmed on the same channel (reason: {})", reason);
                return Ok(());
            }
            Err(e) => {
                warn!("in-place rearm failed, recreating wildcard: {}", e);
            }
        }

        Self::teardown_channel(ch.as_mut(), ant::WILDCARD_DEVICE_ID);
        drop(ch);
        time::sleep(SETTLE_AFTER_RELEASE).await;

        self.open_wildcard()?;
        debug!("wildcard recreated (reason: {})", reason);
        Ok(())
    }

    /// Close and reopen the same channel, retrying transient state errors
    /// with a short escalating delay.
    async fn rearm_in_place(
        cfg: &RadioConfig,
        tx: &mpsc::Sender<Event>,
        ch: &mut dyn RadioChannel,
    ) -> Result<(), RadioError> {
        Self::retry_wrong_state(|| ch.close(), "wildcard close").await?;
        time::sleep(SETTLE_AFTER_CLOSE).await;

        Self::configure_wildcard(cfg, ch)?;
        ch.set_broadcast_handler(Self::wildcard_handler(tx.clone()));

        Self::retry_wrong_state(|| ch.open(), "wildcard open").await?;
        Ok(())
    }

    async fn retry_wrong_state<F>(mut op: F, what: &str) -> Result<(), RadioError>
    where
        F: FnMut() -> Result<(), RadioError>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(RadioError::WrongState) if attempt + 1 < REARM_ATTEMPTS => {
                    let delay = REARM_RETRY_BASE + REARM_RETRY_STEP * attempt;
                    debug!("{} hit transient channel state, retrying in {:?}", what, delay);
                    time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ---------- reaper ----------

    async fn on_tick(&mut self) {
        let now = Instant::now();

        for device_id in self.pool.stale(now, self.config.inactivity_release()) {
            self.evict(device_id, "inactive");
        }
        self.pool.prune_attempts(now);

        if let Some(reason) = self.rearm.take_due(now) {
            self.execute_rearm(reason).await;
        }

        // watchdog: the wildcard must always exist
        if self.wildcard.is_none() {
            if let Err(e) = self.open_wildcard() {
                warn!("watchdog could not reopen wildcard: {}", e);
            }
        }
    }

    // ---------- shutdown ----------

    fn shutdown(&mut self) {
        info!("shutting down channel manager");
        for (device_id, mut entry) in self.pool.drain() {
            self.readings.remove(device_id);
            Self::teardown_channel(entry.channel.as_mut(), device_id);
        }
        if let Some(mut ch) = self.wildcard.take() {
            Self::teardown_channel(ch.as_mut(), ant::WILDCARD_DEVICE_ID);
        }
        if let Err(e) = self.node.stop() {
            warn!("radio node stop failed: {}", e);
        }
        info!("channel manager stopped");
    }

    // ---------- driver callbacks ----------

    fn wildcard_handler(tx: mpsc::Sender<Event>) -> BroadcastHandler {
        Box::new(move |payload| {
            // non-extended payloads carry no device number; nothing to do
            if let Some(obs) = ant::decode_extended(payload) {
                let event = Event::Wildcard {
                    device_id: obs.device_id,
                    heart_rate: obs.heart_rate,
                };
                if tx.try_send(event).is_err() {
                    debug!("event queue full, wildcard observation dropped");
                }
            }
        })
    }

    fn dedicated_handler(tx: mpsc::Sender<Event>, device_id: u16) -> BroadcastHandler {
        Box::new(move |payload| {
            if let Some(heart_rate) = ant::decode_heart_rate(payload) {
                let event = Event::Dedicated {
                    device_id,
                    heart_rate,
                };
                if tx.try_send(event).is_err() {
                    debug!("event queue full, reading from {} dropped", device_id);
                }
            }
        })
    }
}
