//! Event engine.
//!
//! Normalizes stateful and stateless events from the attached producers,
//! keeps per-event state, drives periodic events, and emits the 10 s
//! continuation ticks (with optional state-emulation dummies) while a
//! stateful event is active.  Event handling is serialized through the
//! engine's channel; sinks never see concurrent callbacks.

use crate::media::EventProducer;
use crate::timers::{self, TimerHandle};
use agent_proto::time::{self, Time};
use agent_proto::{EventConfig, EventObject, EventStatus, EventsConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Interval of the "ongoing" tick for active stateful events.
const CONTINUATION_PERIOD: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Config & sink
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EngineConfig {
    pub send_qos_report_as_separate_event: bool,
    pub send_qos_report_period: Duration,
    pub stateful_event_continuation_kick_snapshot: bool,
    /// Builder for the qos-report meta payload.
    pub qos_meta: Option<Arc<dyn Fn() -> serde_json::Value + Send + Sync>>,
}

/// Upper-layer reactions to normalized events.  `SyncHandle` is whatever the
/// sink uses to track one records-delivery request; the engine only stores
/// and returns it.
pub trait EventSink: Send + Sync + 'static {
    type SyncHandle: Send + 'static;

    fn on_event_start(&self, config: &EventConfig, t: Time);
    fn on_event_stop(&self, config: &EventConfig, t: Time);
    fn on_event_trigger(&self, config: &EventConfig, t: Time);
    fn on_event_continue(&self, config: &EventConfig, t: Time);

    fn on_stream_sync_start(&self, config: &EventConfig, t: Time) -> Option<Self::SyncHandle>;
    fn on_stream_sync_stop(&self, config: &EventConfig, t: Time, handle: Option<Self::SyncHandle>);
    /// Returns the handle to keep; returning a different one signals a
    /// delivery-mode hand-off.
    fn on_stream_sync_continue(
        &self,
        config: &EventConfig,
        t: Time,
        handle: Option<Self::SyncHandle>,
    ) -> Option<Self::SyncHandle>;

    /// Ship the event (and capture its snapshot when asked) to the cloud.
    fn on_event_payload(&self, event: EventObject, need_snapshot: bool);
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

enum EngineMsg {
    Notify(EventObject),
    GetEvents(oneshot::Sender<EventsConfig>),
    SetEvents(EventsConfig, oneshot::Sender<bool>),
    Trigger {
        name: String,
        meta: Option<serde_json::Value>,
        time: Time,
        ack: oneshot::Sender<bool>,
    },
    PeriodicFire(String),
    ContinuationTick(String),
    Stop(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EventEngine {
    tx: mpsc::UnboundedSender<EngineMsg>,
}

impl EventEngine {
    pub fn spawn<S: EventSink>(
        config: EngineConfig,
        producers: Vec<Arc<dyn EventProducer>>,
        sink: Arc<S>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        // Producers push plain event objects; bridge them onto the engine
        // channel.
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<EventObject>();
        let bridge = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                if bridge.send(EngineMsg::Notify(event)).is_err() {
                    break;
                }
            }
        });

        let actor = Actor {
            config,
            sink,
            producers,
            notify_tx,
            tx: tx.clone(),
            events_config: EventsConfig::default(),
            producer_configs: HashMap::new(),
            states: HashMap::new(),
            periodic: HashMap::new(),
        };
        tokio::spawn(actor.run(rx));
        EventEngine { tx }
    }

    pub fn notify(&self, event: EventObject) {
        let _ = self.tx.send(EngineMsg::Notify(event));
    }

    /// Event inventory for `cam_events_conf`; internal events are elided.
    /// Also (re)arms periodic timers and producer delivery.
    pub async fn get_events(&self) -> EventsConfig {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(EngineMsg::GetEvents(tx));
        rx.await.unwrap_or_default()
    }

    /// Apply a cloud-pushed flag update.  Caps never change; an update that
    /// tries is rejected per event.
    pub async fn set_events(&self, config: EventsConfig) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(EngineMsg::SetEvents(config, tx));
        rx.await.unwrap_or(false)
    }

    pub async fn trigger(
        &self,
        name: &str,
        meta: Option<serde_json::Value>,
        time: Time,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(EngineMsg::Trigger {
            name: name.to_owned(),
            meta,
            time,
            ack: tx,
        });
        rx.await.unwrap_or(false)
    }

    /// Stop producers and force-stop active stateful events so every start
    /// observed by the sink gets its stop.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(EngineMsg::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct EventState<U> {
    active: bool,
    start: Option<Time>,
    continuation: Option<TimerHandle>,
    sync_handle: Option<U>,
}

impl<U> Default for EventState<U> {
    fn default() -> Self {
        EventState {
            active: false,
            start: None,
            continuation: None,
            sync_handle: None,
        }
    }
}

struct Actor<S: EventSink> {
    config: EngineConfig,
    sink: Arc<S>,
    producers: Vec<Arc<dyn EventProducer>>,
    notify_tx: mpsc::UnboundedSender<EventObject>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    events_config: EventsConfig,
    /// Per-producer config sets; caps are frozen at first load.
    producer_configs: HashMap<String, Vec<EventConfig>>,
    states: HashMap<String, EventState<S::SyncHandle>>,
    periodic: HashMap<String, TimerHandle>,
}

impl<S: EventSink> Actor<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                EngineMsg::Notify(event) => self.handle_event(event),
                EngineMsg::GetEvents(ack) => {
                    let _ = ack.send(self.get_events());
                }
                EngineMsg::SetEvents(config, ack) => {
                    let _ = ack.send(self.set_events(config));
                }
                EngineMsg::Trigger {
                    name,
                    meta,
                    time,
                    ack,
                } => {
                    let _ = ack.send(self.trigger_event(&name, meta, time));
                }
                EngineMsg::PeriodicFire(name) => self.fire_periodic(&name),
                EngineMsg::ContinuationTick(name) => self.continuation_tick(&name),
                EngineMsg::Stop(ack) => {
                    self.shutdown();
                    let _ = ack.send(());
                    return;
                }
            }
        }
    }

    // -- config composition -------------------------------------------------

    fn internal_events(&self) -> Vec<EventConfig> {
        let mut internals = Vec::new();

        if self.config.send_qos_report_as_separate_event {
            let mut qos = EventConfig::custom("qos-report");
            qos.active = true;
            qos.period = self.config.send_qos_report_period.as_secs();
            qos.caps.periodic = true;
            internals.push(qos);
        }

        let mut timeline_sync = EventConfig::custom("timeline-sync");
        timeline_sync.active = true;
        timeline_sync.stream = true;
        timeline_sync.caps.stream = true;
        timeline_sync.caps.stateful = true;
        timeline_sync.caps.internal_hidden = true;
        internals.push(timeline_sync);

        internals
    }

    fn load_events_configs(&mut self) {
        // Everything the device offers is enabled by default; the cloud's
        // persisted view arrives later via set_events.
        self.events_config.enabled = true;

        for internal in self.internal_events() {
            if !self.events_config.events.iter().any(|c| c.name_eq(&internal)) {
                debug!(event = %internal.name(), "appending internal event");
                self.events_config.events.push(internal);
            }
        }

        for producer in &self.producers {
            let declared = producer.events();
            info!(
                producer = producer.name(),
                events = declared.len(),
                "event producer declared its events"
            );
            self.producer_configs
                .entry(producer.name().to_owned())
                .or_insert_with(|| declared.clone());
            if !update_events_configs(&declared, &mut self.events_config.events, true) {
                error!(producer = producer.name(), "unable to apply producer event configs");
            }
        }

        for conf in &self.events_config.events {
            self.states.entry(conf.name()).or_default();
        }
    }

    fn ensure_loaded(&mut self) {
        if self.events_config.events.is_empty() {
            self.load_events_configs();
        }
    }

    fn get_events(&mut self) -> EventsConfig {
        self.cancel_periodic_events();
        self.stop_producers();

        self.ensure_loaded();

        let mut snapshot = self.events_config.clone();
        snapshot.events.retain(|c| !c.caps.internal_hidden);

        self.schedule_periodic_events();
        if self.events_config.enabled {
            self.start_producers();
        }

        snapshot
    }

    fn set_events(&mut self, config: EventsConfig) -> bool {
        self.cancel_periodic_events();
        self.stop_producers();

        self.ensure_loaded();

        for producer in &self.producers {
            if let Some(own) = self.producer_configs.get_mut(producer.name()) {
                update_events_configs(&config.events, own, false);
                producer.set_events(own);
            }
        }

        self.events_config.enabled = config.enabled;
        let ok = update_events_configs(&config.events, &mut self.events_config.events, false);

        for conf in &self.events_config.events {
            self.states.entry(conf.name()).or_default();
        }

        if self.events_config.enabled {
            self.start_producers();
        }
        self.schedule_periodic_events();

        ok
    }

    // -- producers & periodic timers ----------------------------------------

    fn start_producers(&self) {
        for producer in &self.producers {
            info!(producer = producer.name(), "starting event producer");
            producer.start(self.notify_tx.clone());
        }
    }

    fn stop_producers(&self) {
        for producer in &self.producers {
            producer.stop();
        }
    }

    fn schedule_periodic_events(&mut self) {
        let periodic: Vec<(String, u64)> = self
            .events_config
            .events
            .iter()
            .filter(|c| c.caps.periodic && c.active)
            .map(|c| (c.name(), c.period))
            .collect();

        for (name, period) in periodic {
            if period == 0 {
                warn!(event = %name, "periodic event with zero period, treating as disabled");
                continue;
            }
            debug!(event = %name, period, "starting periodic event timer");
            let tx = self.tx.clone();
            let fire_name = name.clone();
            let timer = timers::schedule(Duration::from_secs(period), move || {
                let _ = tx.send(EngineMsg::PeriodicFire(fire_name));
            });
            self.periodic.insert(name, timer);
        }
    }

    fn cancel_periodic_events(&mut self) {
        for (name, timer) in self.periodic.drain() {
            debug!(event = %name, "stopping periodic event timer");
            timer.cancel();
        }
    }

    fn fire_periodic(&mut self, name: &str) {
        let Some(conf) = self.events_config.find_by_name(name).cloned() else {
            return;
        };
        if !conf.caps.periodic || !conf.active {
            return;
        }
        // A stale fire may arrive after set_events dropped the period to 0;
        // re-arming with it would spin the engine.
        if conf.period == 0 {
            warn!(event = %name, "periodic event with zero period, treating as disabled");
            return;
        }

        let mut event = EventObject::new(conf.event, conf.custom_event_name.clone(), time::to_epoch(chrono::Utc::now()));
        event.status = Some(EventStatus::Ok);
        if name == "qos-report"
            && let Some(qos_meta) = &self.config.qos_meta
        {
            event.meta = Some(qos_meta());
        }
        self.handle_event(event);

        // Re-arm.
        let tx = self.tx.clone();
        let fire_name = name.to_owned();
        let timer = timers::schedule(Duration::from_secs(conf.period), move || {
            let _ = tx.send(EngineMsg::PeriodicFire(fire_name));
        });
        self.periodic.insert(name.to_owned(), timer);
    }

    // -- event handling ------------------------------------------------------

    fn handle_event(&mut self, event: EventObject) {
        self.ensure_loaded();

        let name = event.name();
        let Some(config) = self.events_config.find(&event).cloned() else {
            warn!(event = %name, "no config for notified event, dropping");
            return;
        };

        if event.state_emulation {
            debug!(event = %name, "state-emulation dummy event");
        } else if !config.active {
            warn!(event = %name, "event disabled by the cloud, dropping");
            return;
        }

        let mut started = false;
        if !event.state_emulation {
            if config.caps.stateful {
                match self.handle_stateful_event(&config, &event) {
                    StatefulOutcome::Dropped => return,
                    StatefulOutcome::Stopped => return,
                    StatefulOutcome::Started => started = true,
                }
            } else {
                if !self.handle_stateless_event(&config, &event) {
                    return;
                }
            }
        }

        // Internal events only drive records delivery; the cloud never sees
        // them as cam_event.
        if config.caps.internal_hidden {
            return;
        }

        // Snapshot for stateless events, for stateful starts, and for
        // continuation dummies when configured.
        let need_snapshot = config.snapshot
            && ((config.caps.stateful && started)
                || !config.caps.stateful
                || (self.config.stateful_event_continuation_kick_snapshot && event.state_emulation));

        self.sink.on_event_payload(event, need_snapshot);
    }

    fn handle_stateful_event(&mut self, config: &EventConfig, event: &EventObject) -> StatefulOutcome {
        let name = config.name();
        let Some(t) = time::from_epoch(event.time) else {
            warn!(event = %name, "event time is invalid, dropping");
            return StatefulOutcome::Dropped;
        };
        let active = event.active.unwrap_or(false);

        let state = self.states.entry(name.clone()).or_default();
        if active == state.active {
            debug!(event = %name, active, "duplicate state transition, dropping");
            return StatefulOutcome::Dropped;
        }
        if !state.active && state.start == Some(t) {
            debug!(event = %name, "repeated start at identical instant, dropping");
            return StatefulOutcome::Dropped;
        }

        if active {
            info!(event = %name, time = %time::to_iso(t), "event STARTED");
            state.active = true;
            state.start = Some(t);
            self.sink.on_event_start(config, t);
            if config.caps.stream && config.stream {
                let handle = self.sink.on_stream_sync_start(config, t);
                if let Some(state) = self.states.get_mut(&name) {
                    state.sync_handle = handle;
                }
            }
            self.arm_continuation(&name);
            StatefulOutcome::Started
        } else {
            if state.start.is_some_and(|start| t < start) {
                warn!(event = %name, "stop before start instant, dropping");
                return StatefulOutcome::Dropped;
            }
            info!(event = %name, time = %time::to_iso(t), "event FINISHED");
            state.active = false;
            state.continuation = None;
            let handle = state.sync_handle.take();
            self.sink.on_event_stop(config, t);
            if config.caps.stream && config.stream {
                self.sink.on_stream_sync_stop(config, t, handle);
            }
            StatefulOutcome::Stopped
        }
    }

    fn handle_stateless_event(&mut self, config: &EventConfig, event: &EventObject) -> bool {
        let name = config.name();
        let Some(t) = time::from_epoch(event.time) else {
            warn!(event = %name, "event time is invalid, dropping");
            return false;
        };

        info!(event = %name, time = %time::to_iso(t), "event TRIGGERED");
        self.states.entry(name).or_default().start = Some(t);
        self.sink.on_event_trigger(config, t);

        if config.caps.stream && config.stream {
            let handle = self.sink.on_stream_sync_start(config, t);
            self.sink.on_stream_sync_stop(config, t, handle);
        }
        true
    }

    fn arm_continuation(&mut self, name: &str) {
        let tx = self.tx.clone();
        let tick_name = name.to_owned();
        let timer = timers::schedule(CONTINUATION_PERIOD, move || {
            let _ = tx.send(EngineMsg::ContinuationTick(tick_name));
        });
        if let Some(state) = self.states.get_mut(name) {
            state.continuation = Some(timer);
        }
    }

    fn continuation_tick(&mut self, name: &str) {
        let Some(config) = self.events_config.find_by_name(name).cloned() else {
            return;
        };
        let Some(state) = self.states.get_mut(name) else {
            return;
        };
        if !state.active || !config.caps.stateful {
            return;
        }

        let t = chrono::Utc::now();
        self.sink.on_event_continue(&config, t);

        if config.caps.state_emulation {
            let mut dummy =
                EventObject::new(config.event, config.custom_event_name.clone(), time::to_epoch(t));
            dummy.state_emulation = true;
            let _ = self.tx.send(EngineMsg::Notify(dummy));
        }

        if config.caps.stream && config.stream {
            let handle = self
                .states
                .get_mut(name)
                .and_then(|state| state.sync_handle.take());
            let new_handle = self.sink.on_stream_sync_continue(&config, t, handle);
            if let Some(state) = self.states.get_mut(name) {
                state.sync_handle = new_handle;
            }
        }

        self.arm_continuation(name);
    }

    fn trigger_event(
        &mut self,
        name: &str,
        meta: Option<serde_json::Value>,
        t: Time,
    ) -> bool {
        self.ensure_loaded();
        let Some(config) = self.events_config.find_by_name(name).cloned() else {
            error!(event = %name, "triggered unknown event");
            return false;
        };
        if !config.caps.trigger || !config.active {
            warn!(event = %name, "event is not triggerable or inactive");
            return false;
        }

        let mut event = EventObject::new(config.event, config.custom_event_name.clone(), time::to_epoch(t));
        event.meta = meta;

        // Route through the owning producer when there is one; it may adjust
        // the event before notifying it back.
        for producer in &self.producers {
            let owns = self
                .producer_configs
                .get(producer.name())
                .is_some_and(|configs| configs.iter().any(|c| c.name() == name));
            if owns {
                return producer.trigger(event);
            }
        }

        self.handle_event(event);
        true
    }

    fn shutdown(&mut self) {
        self.cancel_periodic_events();
        self.stop_producers();

        // Close out every active stateful event so starts and stops stay
        // paired at the sink.
        let now = time::to_epoch(chrono::Utc::now());
        let active: Vec<String> = self
            .states
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(n, _)| n.clone())
            .collect();
        for name in active {
            if let Some(config) = self.events_config.find_by_name(&name).cloned()
                && config.caps.stateful
            {
                info!(event = %name, "force stopping active event");
                let mut stop = EventObject::new(config.event, config.custom_event_name.clone(), now);
                stop.active = Some(false);
                self.handle_event(stop);
            }
        }
    }
}

enum StatefulOutcome {
    Started,
    Stopped,
    Dropped,
}

/// Overlay `new_configs` onto `dest`: flags move freely within caps, caps
/// themselves are immutable.  An entry trying to change caps is rejected and
/// the prior config kept.
fn update_events_configs(
    new_configs: &[EventConfig],
    dest: &mut Vec<EventConfig>,
    append: bool,
) -> bool {
    let mut ok = true;
    for new_conf in new_configs {
        match dest.iter_mut().find(|c| c.name_eq(new_conf)) {
            Some(existing) => {
                if !existing.caps_eq(new_conf) {
                    error!(
                        event = %new_conf.name(),
                        "capabilities changed in config update, rejecting"
                    );
                    ok = false;
                    continue;
                }
                existing.active = new_conf.active;
                existing.period = new_conf.period;
                existing.snapshot = new_conf.snapshot && existing.caps.snapshot;
                existing.stream = new_conf.stream && existing.caps.stream;
            }
            None if append => dest.push(new_conf.clone()),
            None => {}
        }
    }
    ok
}
