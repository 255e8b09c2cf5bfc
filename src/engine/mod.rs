mod error;
mod mutations;
mod queries;
pub mod slots;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLedger = Arc<RwLock<SlotLedger>>;

/// One salon. The schedule version is mirrored in an atomic so the allocator
/// can re-check it while holding a ledger lock without touching the schedule
/// lock (no lock-order cycle with `set_schedule`).
pub struct Salon {
    pub state: RwLock<SalonState>,
    version: AtomicU64,
}

impl Salon {
    fn new(state: SalonState) -> Self {
        let version = state.version;
        Self {
            state: RwLock::new(state),
            version: AtomicU64::new(version),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(super) fn set_version(&self, version: u64) {
        self.version.store(version, Ordering::Release);
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The slot availability and allocation engine for one tenant.
///
/// The Booking Ledger is sharded per slot window: every window with any
/// booking history owns an entry in `ledgers` guarded by its own lock, so
/// concurrent reserves for different slots never contend.
pub struct Engine {
    pub salons: DashMap<Ulid, Arc<Salon>>,
    pub ledgers: DashMap<SlotKey, SharedLedger>,
    /// Reverse lookup: booking id → slot key.
    pub(super) booking_index: DashMap<Ulid, SlotKey>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub clock: Arc<dyn Clock>,
    pub(super) hold_duration_ms: Ms,
}

/// Apply a booking event to a ledger (no locking — caller holds the lock).
fn apply_to_ledger(ledger: &mut SlotLedger, event: &Event, index: &DashMap<Ulid, SlotKey>) {
    match event {
        Event::BookingRequested {
            id,
            salon_id,
            date,
            start,
            end,
            customer_id,
            created_at,
            held_until,
        } => {
            let window = SlotWindow::new(*date, *start, *end);
            ledger.bookings.push(Booking {
                id: *id,
                salon_id: *salon_id,
                window,
                customer_id: *customer_id,
                status: BookingStatus::Requested,
                created_at: *created_at,
                held_until: *held_until,
            });
            index.insert(*id, window.key(*salon_id));
        }
        Event::BookingConfirmed { id, .. } => {
            if let Some(b) = ledger.find_mut(*id) {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(b) = ledger.find_mut(*id) {
                b.status = BookingStatus::Cancelled;
            }
        }
        Event::BookingExpired { id, .. } => {
            if let Some(b) = ledger.find_mut(*id) {
                b.status = BookingStatus::Expired;
            }
        }
        // Schedule events are handled at the salon level, not here
        Event::ScheduleSet { .. } => {}
    }
}

fn schedule_from_event(event: &Event) -> Option<(Ulid, SalonSchedule, u64)> {
    match event {
        Event::ScheduleSet {
            salon_id,
            working_days,
            start_time,
            end_time,
            break_start_time,
            break_end_time,
            slot_duration,
            max_bookings_per_slot,
            version,
        } => Some((
            *salon_id,
            SalonSchedule {
                working_days: *working_days,
                start_time: *start_time,
                end_time: *end_time,
                break_start_time: *break_start_time,
                break_end_time: *break_end_time,
                slot_duration: *slot_duration,
                max_bookings_per_slot: *max_bookings_per_slot,
            },
            *version,
        )),
        _ => None,
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        hold_duration_ms: Ms,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            salons: DashMap::new(),
            ledgers: DashMap::new(),
            booking_index: DashMap::new(),
            wal_tx,
            notify,
            clock,
            hold_duration_ms,
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context (e.g. lazy tenant
        // creation).
        for event in &events {
            if let Some((salon_id, schedule, version)) = schedule_from_event(event) {
                match engine.salons.get(&salon_id) {
                    Some(salon) => {
                        let mut guard = salon.state.try_write().expect("replay: uncontended write");
                        guard.schedule = schedule;
                        guard.version = version;
                        salon.set_version(version);
                    }
                    None => {
                        engine.salons.insert(
                            salon_id,
                            Arc::new(Salon::new(SalonState {
                                id: salon_id,
                                schedule,
                                version,
                            })),
                        );
                    }
                }
                continue;
            }

            let key = match event {
                Event::BookingRequested {
                    salon_id,
                    date,
                    start,
                    ..
                } => SlotKey {
                    salon_id: *salon_id,
                    date: *date,
                    start: *start,
                },
                other => match engine.booking_key(&booking_id_of(other)) {
                    Some(key) => key,
                    None => continue, // transition for an archived booking
                },
            };
            let ledger = engine.ledger_for(key);
            let mut guard = ledger.try_write().expect("replay: uncontended write");
            apply_to_ledger(&mut guard, event, &engine.booking_index);
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_salon(&self, id: &Ulid) -> Option<Arc<Salon>> {
        self.salons.get(id).map(|e| e.value().clone())
    }

    /// Ledger for a slot key, created on first touch.
    pub(super) fn ledger_for(&self, key: SlotKey) -> SharedLedger {
        self.ledgers.entry(key).or_default().clone()
    }

    /// Ledger for a slot key if any booking ever touched it.
    pub(super) fn get_ledger(&self, key: &SlotKey) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    pub(super) fn booking_key(&self, booking_id: &Ulid) -> Option<SlotKey> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call, under the caller's ledger lock.
    pub(super) async fn persist_and_apply(
        &self,
        guard: &mut SlotLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_ledger(guard, event, &self.booking_index);
        self.notify.send(event.salon_id(), event);
        Ok(())
    }
}

/// Extract the booking id from a transition event.
fn booking_id_of(event: &Event) -> Ulid {
    match event {
        Event::BookingRequested { id, .. }
        | Event::BookingConfirmed { id, .. }
        | Event::BookingCancelled { id, .. }
        | Event::BookingExpired { id, .. } => *id,
        Event::ScheduleSet { salon_id, .. } => *salon_id,
    }
}
