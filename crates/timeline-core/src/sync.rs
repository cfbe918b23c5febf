//! Timeline synchronizer.
//!
//! Consumes sync requests (closed or open-ended), walks the source timeline
//! in fixed-size chunks, subtracts slices the destination already holds, and
//! uploads the rest.  Overlapping requests coalesce: a later segmenter skips
//! every range an earlier, already-processed segmenter delivered, which is
//! what turns N overlapping event-driven requests into one contiguous remote
//! timeline.
//!
//! All segmenter state lives inside a single actor task; upload completions
//! come back as `ChunkDone` records on the actor's own channel, so no state
//! is ever touched from another task.

use crate::period::Period;
use crate::storage::{CancelProbe, Item, TimelineSink, TimelineSource};
use agent_proto::time::{self, Time};
use chrono::TimeDelta;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Chunk duration for event-driven record upload.
    pub step: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            step: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequestStatus {
    Pending,
    Done,
    Error,
    Canceled,
}

/// One progress report for one sync request.  The terminal status is
/// reported exactly once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatusReport {
    pub request_id: u64,
    pub ticket: String,
    pub progress: u32,
    pub status: SyncRequestStatus,
}

impl SyncStatusReport {
    pub fn is_terminal(&self) -> bool {
        self.status != SyncRequestStatus::Pending
    }
}

/// Handle to a submitted request, used for `sync_finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Segmenter
// ---------------------------------------------------------------------------

/// State of one sync request as it walks the source timeline.
#[derive(Debug)]
struct Segmenter {
    id: u64,
    begin: Time,
    /// `None` = open-ended tail; closed later by `sync_finalize`.
    end: Option<Time>,
    cur_begin: Time,
    cur_end: Time,
    /// Chunk duration.
    step: Duration,
    last_processed: Instant,
    delay: Duration,
    /// Chunking finished; uploads may still be in flight.
    processed: bool,
    /// All planned chunks terminated, successfully or not.
    finished: bool,
    canceled: bool,
    /// Wall-clock pacing between chunks (tail mode).
    realtime: bool,
    ticket: String,
    planned: u64,
    done: u64,
    failed: u64,
    final_reported: bool,
    cancel_flag: Arc<AtomicBool>,
}

impl Segmenter {
    fn effective_end(&self) -> Option<Time> {
        self.end
    }

    /// Inclusive-bound request intersection; open ends reach to infinity.
    fn intersects(&self, other: &Segmenter) -> bool {
        match (self.end, other.end) {
            (Some(e1), Some(e2)) => self.begin <= e2 && e1 >= other.begin,
            (Some(e1), None) => e1 >= other.begin,
            (None, Some(e2)) => self.begin <= e2,
            (None, None) => true,
        }
    }

    fn mark_canceled(&mut self) {
        self.canceled = true;
        self.processed = true;
        self.finished = true;
        self.cancel_flag.store(true, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

struct SyncSpec {
    id: u64,
    begin: Time,
    end: Option<Time>,
    ticket: String,
    delay: Duration,
}

enum Msg {
    Sync(SyncSpec),
    Enqueue(u64),
    Finalize { id: u64, end: Time },
    Cancel { ticket: String },
    ChunkDone { id: u64, ok: bool },
    Stop(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the synchronizer actor.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    tx: mpsc::UnboundedSender<Msg>,
    next_id: Arc<AtomicU64>,
}

impl Synchronizer {
    /// Spawn the actor over a source and a destination timeline.  Status
    /// reports for every request arrive on `status_tx`.
    pub fn spawn<S, D>(
        config: SyncConfig,
        src: S,
        dst: D,
        status_tx: mpsc::UnboundedSender<SyncStatusReport>,
    ) -> Self
    where
        S: TimelineSource,
        D: TimelineSink,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config,
            src: Arc::new(src),
            dst: Arc::new(dst),
            status_tx,
            tx: tx.clone(),
            segmenters: Vec::new(),
            scheduled: HashMap::new(),
            canceled_tickets: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        Synchronizer {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submit a request for `[begin, end)`; `end == None` tails real time.
    /// `delay` postpones the first chunk (event-driven uploads are delayed so
    /// neighbouring requests merge).
    pub fn sync(
        &self,
        begin: Time,
        end: Option<Time>,
        ticket: impl Into<String>,
        delay: Duration,
    ) -> SyncRequest {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Msg::Sync(SyncSpec {
            id,
            begin,
            end,
            ticket: ticket.into(),
            delay,
        }));
        SyncRequest { id }
    }

    /// Close the tail of an open-ended request.
    pub fn sync_finalize(&self, request: SyncRequest, end: Time) {
        let _ = self.tx.send(Msg::Finalize {
            id: request.id,
            end,
        });
    }

    /// Cancel every request carrying `ticket`.  Each affected request
    /// reports its terminal CANCELED exactly once, at cancellation; results
    /// of uploads still in flight are counted but no longer reported.
    pub fn sync_cancel(&self, ticket: impl Into<String>) {
        let _ = self.tx.send(Msg::Cancel {
            ticket: ticket.into(),
        });
    }

    /// Stop the actor and purge all segmenters.  In-flight stores keep
    /// running to completion; their results are dropped.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Msg::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor<S, D> {
    config: SyncConfig,
    src: Arc<S>,
    dst: Arc<D>,
    status_tx: mpsc::UnboundedSender<SyncStatusReport>,
    tx: mpsc::UnboundedSender<Msg>,
    segmenters: Vec<Segmenter>,
    /// Requests waiting out their start delay.
    scheduled: HashMap<u64, (Segmenter, JoinHandle<()>)>,
    canceled_tickets: Vec<String>,
}

const IDLE_TICK: Duration = Duration::from_secs(1);

impl<S: TimelineSource, D: TimelineSink> Actor<S, D> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        let mut next_tick = Instant::now() + IDLE_TICK;
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(msg) => {
                            if self.handle(msg) {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                () = tokio::time::sleep_until(next_tick) => {
                    let delay = self.tick().await;
                    next_tick = Instant::now() + delay;
                }
            }
        }
    }

    /// Returns true when the actor must terminate.
    fn handle(&mut self, msg: Msg) -> bool {
        match msg {
            Msg::Sync(spec) => self.add_request(spec),
            Msg::Enqueue(id) => {
                if let Some((seg, _timer)) = self.scheduled.remove(&id) {
                    debug!(seg = seg.id, "segmenter enqueued");
                    self.segmenters.push(seg);
                }
            }
            Msg::Finalize { id, end } => self.finalize(id, end),
            Msg::Cancel { ticket } => self.cancel_by_ticket(&ticket),
            Msg::ChunkDone { id, ok } => self.on_chunk_done(id, ok),
            Msg::Stop(ack) => {
                self.shutdown();
                let _ = ack.send(());
                return true;
            }
        }
        false
    }

    fn add_request(&mut self, spec: SyncSpec) {
        let step = TimeDelta::from_std(self.config.step).unwrap_or(TimeDelta::seconds(15));
        let mut cur_end = spec.begin + step;
        if let Some(end) = spec.end {
            cur_end = cur_end.min(end);
        }
        let seg = Segmenter {
            id: spec.id,
            begin: spec.begin,
            end: spec.end,
            cur_begin: spec.begin,
            cur_end,
            step: self.config.step,
            last_processed: Instant::now(),
            delay: spec.delay,
            processed: false,
            finished: false,
            canceled: false,
            realtime: spec.end.is_none(),
            ticket: spec.ticket,
            planned: 0,
            done: 0,
            failed: 0,
            final_reported: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        };

        debug!(
            seg = seg.id,
            begin = %time::to_iso_packed(seg.begin),
            end = %seg.end.map(time::to_iso_packed).unwrap_or_default(),
            ticket = %seg.ticket,
            delay_ms = spec.delay.as_millis() as u64,
            "sync request"
        );

        if spec.delay.is_zero() {
            self.segmenters.push(seg);
        } else {
            let tx = self.tx.clone();
            let id = seg.id;
            let delay = spec.delay;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(Msg::Enqueue(id));
            });
            self.scheduled.insert(id, (seg, timer));
        }
    }

    fn finalize(&mut self, id: u64, end: Time) {
        debug!(seg = id, end = %time::to_iso_packed(end), "finalize sync request");
        if let Some(seg) = self.segmenters.iter_mut().find(|s| s.id == id) {
            seg.end = Some(end);
        } else if let Some((seg, _)) = self.scheduled.get_mut(&id) {
            seg.end = Some(end);
        }
    }

    fn cancel_by_ticket(&mut self, ticket: &str) {
        if ticket.is_empty() {
            return;
        }

        for seg in &mut self.segmenters {
            if seg.ticket == ticket && !seg.canceled {
                seg.mark_canceled();
                info!(seg = seg.id, ticket, "segmenter canceled");
                report_status(seg, &mut self.canceled_tickets, &self.status_tx);
            }
        }

        let canceled_ids: Vec<u64> = self
            .scheduled
            .iter()
            .filter(|(_, (seg, _))| seg.ticket == ticket)
            .map(|(id, _)| *id)
            .collect();
        for id in canceled_ids {
            if let Some((mut seg, timer)) = self.scheduled.remove(&id) {
                timer.abort();
                seg.mark_canceled();
                info!(seg = seg.id, ticket, "scheduled segmenter canceled");
                report_status(&mut seg, &mut self.canceled_tickets, &self.status_tx);
            }
        }

        // Keep the ticket around: a segmenter with an upload already in
        // flight may have left the list, its completion must still report
        // CANCELED.
        self.canceled_tickets.push(ticket.to_owned());
    }

    fn on_chunk_done(&mut self, id: u64, ok: bool) {
        let Some(idx) = self.segmenters.iter().position(|s| s.id == id) else {
            // Only cancellation purges a segmenter with uploads still in
            // flight, and its terminal CANCELED was reported back then.
            debug!(seg = id, ok, "late chunk completion for purged segmenter");
            return;
        };

        let seg = &mut self.segmenters[idx];
        if ok {
            seg.done += 1;
        } else {
            seg.failed += 1;
        }
        seg.finished = seg.processed && seg.planned == seg.done + seg.failed;

        info!(
            seg = seg.id,
            ok,
            done = seg.done,
            failed = seg.failed,
            planned = seg.planned,
            processed = seg.processed,
            finished = seg.finished,
            "chunk upload finished"
        );

        report_status(seg, &mut self.canceled_tickets, &self.status_tx);
    }

    /// One pass of the stepping loop; returns the delay until the next pass.
    async fn tick(&mut self) -> Duration {
        let mut delay = IDLE_TICK;

        while self.adjust_current_to_finished() {}

        if !self.segmenters.is_empty()
            && let Some(idx) = self.current()
        {
            if self.check_remote_window(idx).await {
                self.step(idx).await;
            }
            report_status(
                &mut self.segmenters[idx],
                &mut self.canceled_tickets,
                &self.status_tx,
            );
            let seg = &self.segmenters[idx];
            if !seg.processed {
                delay = seg.delay;
            }
        }

        delay
    }

    /// Earliest non-processed segmenter; purges canceled ones and, when all
    /// are processed, the finished ones.
    fn current(&mut self) -> Option<usize> {
        if self.segmenters.is_empty() {
            return None;
        }

        // Purge canceled segmenters; their terminal status is already out.
        self.segmenters.retain(|s| {
            if s.canceled {
                debug!(seg = s.id, "purging canceled segmenter");
            }
            !s.canceled
        });

        self.segmenters.sort_by_key(|s| s.begin);

        match self.segmenters.iter().position(|s| !s.processed) {
            Some(idx) => Some(idx),
            None => {
                // Everything processed: finished segmenters are no longer
                // needed for coalescing.
                self.segmenters.retain(|s| {
                    if s.finished {
                        debug!(seg = s.id, "freeing finished segmenter");
                    }
                    !s.finished
                });
                None
            }
        }
    }

    /// Coalescing pass: let the current segmenter skip ranges already
    /// delivered by processed, intersecting segmenters.  Returns true when
    /// an adjustment happened and the pass must be re-run (confluence).
    fn adjust_current_to_finished(&mut self) -> bool {
        let Some(idx) = self.current() else {
            return false;
        };

        let step = self.step_delta();
        for i in 0..self.segmenters.len() {
            if i == idx {
                continue;
            }
            let (cur_begin, other_cur_begin) =
                (self.segmenters[idx].cur_begin, self.segmenters[i].cur_begin);
            if self.segmenters[i].processed
                && self.segmenters[idx].intersects(&self.segmenters[i])
                && cur_begin < other_cur_begin
            {
                let seg = &mut self.segmenters[idx];
                seg.cur_begin = other_cur_begin;
                seg.cur_end = seg.cur_begin + step;
                // That range was in fact delivered, just by another
                // segmenter.
                seg.planned += 1;
                seg.done += 1;

                debug!(
                    seg = seg.id,
                    cur_begin = %time::to_iso_packed(seg.cur_begin),
                    cur_end = %time::to_iso_packed(seg.cur_end),
                    "processing window adjusted to finished segmenter"
                );

                if let Some(end) = seg.effective_end()
                    && seg.cur_begin >= end
                {
                    debug!(seg = seg.id, "data fully delivered elsewhere, finalizing");
                    seg.processed = true;
                    seg.finished = true;
                    report_status(seg, &mut self.canceled_tickets, &self.status_tx);
                    return true;
                }
            }
        }
        false
    }

    /// Subtract already-present remote slices from the current window.
    /// Returns true when the window survived and should be uploaded.
    async fn check_remote_window(&mut self, idx: usize) -> bool {
        let (win_begin, win_end) = {
            let seg = &self.segmenters[idx];
            (seg.cur_begin, seg.cur_end)
        };
        if win_begin >= win_end {
            return true;
        }

        let slices = self.dst.slices(win_begin, win_end).await;
        let step = self.step_delta();
        let seg = &mut self.segmenters[idx];
        let mut upload_current_window = true;

        for slice in slices {
            if !slice.intersects(&Period::new(seg.cur_begin, seg.cur_end)) {
                continue;
            }

            debug!(
                seg = seg.id,
                slice_begin = %time::to_iso_packed(slice.begin),
                slice_end = %time::to_iso_packed(slice.end),
                "remote slice intersects upload window"
            );

            // Either move the window start past the slice, or pull the
            // window end back to the slice start.
            if seg.cur_begin >= slice.begin {
                seg.cur_begin = slice.end;
            } else {
                seg.cur_end = slice.begin;
            }

            // Slice swallowed the whole window; pick the next one and
            // re-check it against the remote data.
            if seg.cur_end <= seg.cur_begin {
                seg.cur_end = seg.cur_begin + step;
                upload_current_window = false;
            }

            if let Some(end) = seg.effective_end()
                && seg.cur_begin > end
            {
                debug!(seg = seg.id, "remainder already on the cloud, finalizing");
                seg.processed = true;
                seg.finished = seg.planned == seg.done + seg.failed;
                upload_current_window = false;
                break;
            }

            // Count the intersection as delivered so the request is not
            // treated as failed.
            seg.planned += 1;
            seg.done += 1;
        }

        upload_current_window
    }

    /// One chunk step for the current segmenter.
    async fn step(&mut self, idx: usize) {
        let step = self.step_delta();

        {
            let seg = &mut self.segmenters[idx];
            if seg.processed || seg.canceled {
                return;
            }

            // Window already past a (finalized) end: nothing left to chunk.
            if let Some(end) = seg.effective_end()
                && seg.cur_begin >= end
            {
                seg.processed = true;
                if seg.planned == seg.done + seg.failed {
                    seg.finished = true;
                }
                if seg.planned == 0 {
                    warn!(seg = seg.id, "no chunk was exported for the request");
                }
                return;
            }

            if let Some(end) = seg.effective_end()
                && seg.cur_end > end
            {
                seg.cur_end = end;
            }

            if seg.cur_begin == seg.cur_end {
                warn!(seg = seg.id, "empty chunk, skipping");
                seg.cur_end = seg.cur_begin + step;
                return;
            }

            debug!(
                seg = seg.id,
                cur_begin = %time::to_iso_packed(seg.cur_begin),
                cur_end = %time::to_iso_packed(seg.cur_end),
                "processing chunk"
            );
        }

        let (win_begin, win_end) = {
            let seg = &self.segmenters[idx];
            (seg.cur_begin, seg.cur_end)
        };
        let items = self.src.list(win_begin, win_end).await;
        let item = items.into_iter().next();

        let seg = &mut self.segmenters[idx];
        adjust_delay(seg, item.as_ref());

        // An exported clip moves the window to its own end; a missing or
        // broken clip skips the requested window entirely.
        let mut upload: Option<Item> = None;
        match item {
            Some(item) if item.period.duration() > TimeDelta::minutes(10) => {
                warn!(seg = seg.id, "exported record longer than 10 minutes, skipping");
                seg.cur_begin = seg.cur_end;
            }
            Some(item) => {
                seg.planned += 1;
                seg.cur_begin = item.period.end;
                upload = Some(item);
            }
            None => {
                warn!(
                    seg = seg.id,
                    begin = %time::to_iso_packed(win_begin),
                    end = %time::to_iso_packed(win_end),
                    "source returned nothing, skipping requested period"
                );
                seg.cur_begin = seg.cur_end;
            }
        }
        seg.cur_end = seg.cur_begin + step;

        if let Some(end) = seg.effective_end()
            && end <= seg.cur_begin
        {
            seg.processed = true;
            if seg.planned == seg.done + seg.failed {
                seg.finished = true;
            }
            info!(
                seg = seg.id,
                begin = %time::to_iso_packed(seg.begin),
                end = %time::to_iso_packed(end),
                "final chunk for sync request"
            );
        }

        match upload {
            Some(mut item) => {
                let seg_id = seg.id;
                let probe = CancelProbe::new(seg.cancel_flag.clone());
                if self.src.load(&mut item).await {
                    let dst = Arc::clone(&self.dst);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let ok = dst.store(item, probe).await;
                        let _ = tx.send(Msg::ChunkDone { id: seg_id, ok });
                    });
                } else {
                    let seg = &mut self.segmenters[idx];
                    seg.failed += 1;
                    warn!(seg = seg.id, "failed to load storage item");
                }
            }
            None => {
                let seg = &mut self.segmenters[idx];
                if seg.processed && seg.planned == 0 {
                    warn!(seg = seg.id, "failed to export any chunk for the request");
                    seg.finished = true;
                }
            }
        }
    }

    fn step_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.step).unwrap_or(TimeDelta::seconds(15))
    }

    fn shutdown(&mut self) {
        for (_, (seg, timer)) in self.scheduled.drain() {
            debug!(seg = seg.id, "dropping scheduled sync start");
            timer.abort();
        }
        for seg in &self.segmenters {
            if !seg.finished || !seg.processed {
                debug!(seg = seg.id, "purging unfinished segmenter");
            }
        }
        self.segmenters.clear();
    }
}

// ---------------------------------------------------------------------------
// Pacing & reporting
// ---------------------------------------------------------------------------

/// Wall-clock pacing for the next chunk.  Tail segmenters aim for one step
/// per step-duration of real time, compensating both loop overhead and the
/// difference between the requested window and the clip actually exported.
fn adjust_delay(seg: &mut Segmenter, item: Option<&Item>) {
    let now = Instant::now();

    if seg.realtime {
        let step_ms = i64::try_from(seg.step.as_millis()).unwrap_or(i64::MAX);
        let elapsed_ms = i64::try_from((now - seg.last_processed).as_millis()).unwrap_or(i64::MAX);
        let prior_ms = i64::try_from(seg.delay.as_millis()).unwrap_or(i64::MAX);

        let extra = elapsed_ms - prior_ms;
        let mut delay_ms = (step_ms - extra).max(0);

        if let Some(item) = item
            && item.is_valid()
        {
            delay_ms += (item.period.end - seg.cur_end).num_milliseconds();
        }

        seg.delay = Duration::from_millis(delay_ms.max(0) as u64);
    } else {
        seg.delay = Duration::ZERO;
    }

    seg.last_processed = now;
}

fn report_status(
    seg: &mut Segmenter,
    canceled_tickets: &mut Vec<String>,
    status_tx: &mpsc::UnboundedSender<SyncStatusReport>,
) {
    let mut progress = if seg.processed {
        if seg.planned == 0 {
            100
        } else {
            ((seg.done + seg.failed) * 100 / seg.planned) as u32
        }
    } else {
        0
    };

    // A cancel for this ticket may have been recorded before this segmenter
    // got to report; sweep the retained ticket list.
    if !seg.ticket.is_empty()
        && let Some(pos) = canceled_tickets.iter().position(|t| *t == seg.ticket)
    {
        canceled_tickets.remove(pos);
        if !seg.canceled {
            info!(seg = seg.id, ticket = %seg.ticket, "sync request was canceled");
            seg.mark_canceled();
        }
    }

    if seg.final_reported {
        return;
    }

    let status = if seg.canceled {
        // CANCELED is terminal too; completions of uploads still in flight
        // must not re-report it.
        seg.final_reported = true;
        SyncRequestStatus::Canceled
    } else if seg.finished {
        seg.final_reported = true;
        progress = 100;
        if seg.done == 0 {
            SyncRequestStatus::Error
        } else {
            SyncRequestStatus::Done
        }
    } else {
        SyncRequestStatus::Pending
    };

    let _ = status_tx.send(SyncStatusReport {
        request_id: seg.id,
        ticket: seg.ticket.clone(),
        progress,
        status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Time {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn seg(begin: i64, end: Option<i64>) -> Segmenter {
        Segmenter {
            id: 0,
            begin: at(begin),
            end: end.map(at),
            cur_begin: at(begin),
            cur_end: at(begin + 15),
            step: Duration::from_secs(15),
            last_processed: Instant::now(),
            delay: Duration::ZERO,
            processed: false,
            finished: false,
            canceled: false,
            realtime: end.is_none(),
            ticket: String::new(),
            planned: 0,
            done: 0,
            failed: 0,
            final_reported: false,
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn request_intersection_includes_touching_bounds() {
        assert!(seg(0, Some(10)).intersects(&seg(10, Some(20))));
        assert!(!seg(0, Some(10)).intersects(&seg(11, Some(20))));
        assert!(seg(0, None).intersects(&seg(1000, Some(2000))));
        assert!(seg(1000, Some(2000)).intersects(&seg(0, None)));
    }

    #[test]
    fn terminal_status_is_reported_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tickets = Vec::new();
        let mut s = seg(0, Some(15));
        s.processed = true;
        s.finished = true;
        s.planned = 1;
        s.done = 1;

        report_status(&mut s, &mut tickets, &tx);
        report_status(&mut s, &mut tickets, &tx);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.status, SyncRequestStatus::Done);
        assert_eq!(first.progress, 100);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn retained_ticket_cancels_late_reporter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut tickets = vec!["req-9".to_owned()];
        let mut s = seg(0, Some(15));
        s.ticket = "req-9".to_owned();

        report_status(&mut s, &mut tickets, &tx);

        assert!(s.canceled);
        assert!(tickets.is_empty());
        assert_eq!(rx.try_recv().unwrap().status, SyncRequestStatus::Canceled);
    }
}
