use std::sync::Arc;

use chrono::Days;
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::clock::{date_of, slot_start_ms};
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, Salon, SharedLedger, WalCommand};

impl Engine {
    /// Create or replace a salon's schedule. Returns the new schedule version.
    ///
    /// An update holds the salon's schedule lock for the whole capacity scan,
    /// so no reservation pinned to the old version can slip in between the
    /// scan and the version bump.
    pub async fn set_schedule(
        &self,
        salon_id: Ulid,
        schedule: SalonSchedule,
    ) -> Result<u64, EngineError> {
        schedule.validate().map_err(EngineError::Validation)?;
        if schedule.max_bookings_per_slot > MAX_CAPACITY_PER_SLOT {
            return Err(EngineError::LimitExceeded("max_bookings_per_slot too large"));
        }

        let salon = match self.get_salon(&salon_id) {
            Some(salon) => salon,
            None => {
                if self.salons.len() >= MAX_SALONS_PER_TENANT {
                    return Err(EngineError::LimitExceeded("too many salons"));
                }
                self.salons
                    .entry(salon_id)
                    .or_insert_with(|| {
                        Arc::new(Salon::new(SalonState {
                            id: salon_id,
                            schedule: schedule.clone(),
                            version: 0,
                        }))
                    })
                    .value()
                    .clone()
            }
        };

        let mut state = salon.state.write().await;

        // Capacity-narrowing guard: a future window the new schedule still
        // generates must keep room for every booking already confirmed in
        // it. Windows the new schedule no longer generates are left alone;
        // their confirmed bookings stand, they just take no new ones.
        let today = date_of(self.clock.now_ms());
        for (window, ledger) in self.salon_ledgers(salon_id) {
            if window.date < today || !super::slots::contains_window(&schedule, &window) {
                continue;
            }
            let confirmed = ledger.read().await.confirmed_count();
            if confirmed > schedule.max_bookings_per_slot {
                return Err(EngineError::CapacityConflict {
                    confirmed,
                    new_capacity: schedule.max_bookings_per_slot,
                });
            }
        }

        let version = state.version + 1;
        let event = Event::schedule_set(salon_id, &schedule, version);
        self.wal_append(&event).await?;

        state.schedule = schedule;
        state.version = version;
        salon.set_version(version);
        drop(state);

        self.notify.send(salon_id, &event);
        info!(salon_id = %salon_id, version, "schedule set");
        Ok(version)
    }

    /// Atomically claim one capacity unit in a slot window. On success the
    /// booking enters `Requested` with a hold that lapses after the tenant's
    /// hold duration unless confirmed.
    ///
    /// The capacity check and the insert happen under a single ledger write
    /// lock; the schedule version pinned before taking the lock is re-checked
    /// under it, and a concurrent schedule edit sends us around the loop
    /// again rather than admitting a booking against a stale schedule.
    pub async fn reserve(
        &self,
        salon_id: Ulid,
        booking_id: Ulid,
        customer_id: Ulid,
        window: SlotWindow,
    ) -> Result<Booking, EngineError> {
        if self.booking_index.contains_key(&booking_id) {
            record_reserve_outcome("already_exists");
            return Err(EngineError::AlreadyExists(booking_id));
        }

        for _ in 0..MAX_RESERVE_RETRIES {
            let salon = self
                .get_salon(&salon_id)
                .ok_or(EngineError::NotFound(salon_id))?;

            let (schedule, pinned_version) = {
                let state = salon.state.read().await;
                (state.schedule.clone(), state.version)
            };

            let now = self.clock.now_ms();
            let today = date_of(now);
            if window.date < today || window.date > today + Days::new(MAX_BOOKING_HORIZON_DAYS) {
                record_reserve_outcome("invalid_date");
                return Err(EngineError::InvalidDate);
            }
            if !super::slots::contains_window(&schedule, &window) {
                record_reserve_outcome("slot_closed");
                return Err(EngineError::SlotClosed);
            }

            let ledger = self.ledger_for(window.key(salon_id));
            let mut guard = ledger.write().await;

            // The schedule may have changed between the snapshot and the
            // lock. The version atomic is readable without the schedule
            // lock, so this re-check cannot deadlock against set_schedule.
            if salon.version() != pinned_version {
                continue;
            }

            if guard.find(booking_id).is_some() {
                record_reserve_outcome("already_exists");
                return Err(EngineError::AlreadyExists(booking_id));
            }
            if guard.bookings.len() >= MAX_BOOKINGS_PER_LEDGER {
                record_reserve_outcome("limit");
                return Err(EngineError::LimitExceeded("slot ledger full"));
            }

            // A lapsed hold still sits in Requested until its expiry is
            // recorded. Record it here, under the same lock, so admitting
            // the new booking never pushes the Requested+Confirmed count
            // past capacity, however late the sweeper is.
            let lapsed: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Requested && b.held_until <= now)
                .map(|b| b.id)
                .collect();
            for id in lapsed {
                self.persist_and_apply(&mut guard, &Event::BookingExpired { id, salon_id })
                    .await?;
            }

            let capacity = schedule.max_bookings_per_slot;
            if guard.booked_count() >= capacity {
                record_reserve_outcome("slot_full");
                return Err(EngineError::SlotFull(capacity));
            }

            let booking = Booking {
                id: booking_id,
                salon_id,
                window,
                customer_id,
                status: BookingStatus::Requested,
                created_at: now,
                held_until: now + self.hold_duration_ms,
            };
            self.persist_and_apply(&mut guard, &Event::booking_requested(&booking))
                .await?;

            record_reserve_outcome("ok");
            debug!(booking_id = %booking_id, salon_id = %salon_id, "slot reserved");
            return Ok(booking);
        }

        // Retries exhausted under a storm of schedule edits.
        record_reserve_outcome("slot_closed");
        Err(EngineError::SlotClosed)
    }

    /// Promote a held booking to `Confirmed`. Only the requesting customer
    /// may confirm; anyone else sees `NotFound` rather than learning the
    /// booking exists.
    pub async fn confirm(
        &self,
        booking_id: Ulid,
        customer_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let key = self
            .booking_key(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ledger = self
            .get_ledger(&key)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = ledger.write().await;

        let now = self.clock.now_ms();
        let booking = guard
            .find(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.customer_id != customer_id {
            return Err(EngineError::NotFound(booking_id));
        }
        match booking.status {
            BookingStatus::Requested if booking.held_until <= now => {
                return Err(EngineError::ReservationExpired(booking_id));
            }
            BookingStatus::Requested => {}
            status => return Err(EngineError::InvalidState(status)),
        }

        let salon_id = booking.salon_id;
        self.persist_and_apply(
            &mut guard,
            &Event::BookingConfirmed {
                id: booking_id,
                salon_id,
            },
        )
        .await?;

        debug!(booking_id = %booking_id, "booking confirmed");
        guard
            .find(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Cancel a held or confirmed booking, releasing its capacity unit
    /// immediately. Only allowed before the slot's start instant.
    pub async fn cancel(
        &self,
        booking_id: Ulid,
        customer_id: Ulid,
    ) -> Result<Booking, EngineError> {
        let key = self
            .booking_key(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ledger = self
            .get_ledger(&key)
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = ledger.write().await;

        let booking = guard
            .find(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.customer_id != customer_id {
            return Err(EngineError::NotFound(booking_id));
        }
        if matches!(
            booking.status,
            BookingStatus::Cancelled | BookingStatus::Expired
        ) {
            return Err(EngineError::InvalidState(booking.status));
        }
        if self.clock.now_ms() >= slot_start_ms(&booking.window) {
            return Err(EngineError::InvalidState(booking.status));
        }

        let salon_id = booking.salon_id;
        self.persist_and_apply(
            &mut guard,
            &Event::BookingCancelled {
                id: booking_id,
                salon_id,
            },
        )
        .await?;

        debug!(booking_id = %booking_id, "booking cancelled");
        guard
            .find(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// Transition every `Requested` booking whose hold has lapsed at `now`
    /// to `Expired`. Returns how many were expired. Idempotent: a second
    /// sweep at the same instant expires nothing.
    pub async fn expire_sweep(&self, now: Ms) -> Result<usize, EngineError> {
        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();

        let mut expired = 0usize;
        for ledger in ledgers {
            // Cheap read-only probe first; most ledgers have nothing lapsed.
            let candidates: Vec<(Ulid, Ulid)> = {
                let guard = ledger.read().await;
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Requested && b.held_until <= now)
                    .map(|b| (b.id, b.salon_id))
                    .collect()
            };
            if candidates.is_empty() {
                continue;
            }

            let mut guard = ledger.write().await;
            for (id, salon_id) in candidates {
                // Re-check under the write lock: confirm may have won the race.
                let still_lapsed = guard
                    .find(id)
                    .is_some_and(|b| b.status == BookingStatus::Requested && b.held_until <= now);
                if !still_lapsed {
                    continue;
                }
                self.persist_and_apply(&mut guard, &Event::BookingExpired { id, salon_id })
                    .await?;
                expired += 1;
            }
        }

        if expired > 0 {
            metrics::counter!(crate::observability::SWEEP_EXPIRED_TOTAL)
                .increment(expired as u64);
            debug!(expired, "hold sweep");
        }
        Ok(expired)
    }

    /// Drop ledgers whose window date is strictly before `today`. Their
    /// history survives only until the next WAL compaction; this is the
    /// in-memory half of archival.
    pub fn evict_past_ledgers(&self, today: chrono::NaiveDate) -> usize {
        let stale: Vec<SlotKey> = self
            .ledgers
            .iter()
            .filter(|e| e.key().date < today)
            .map(|e| *e.key())
            .collect();
        for key in &stale {
            if let Some((_, ledger)) = self.ledgers.remove(key) {
                // Uncontended: nothing mutates a past-dated ledger.
                if let Ok(guard) = ledger.try_read() {
                    for b in &guard.bookings {
                        self.booking_index.remove(&b.id);
                    }
                }
            }
        }
        stale.len()
    }

    /// All non-empty ledgers belonging to one salon, with their windows.
    fn salon_ledgers(&self, salon_id: Ulid) -> Vec<(SlotWindow, SharedLedger)> {
        self.ledgers
            .iter()
            .filter(|e| e.key().salon_id == salon_id)
            .filter_map(|e| {
                let ledger = e.value().clone();
                // The window's end lives on the bookings; an empty ledger
                // has nothing to conflict with.
                let end = ledger
                    .try_read()
                    .ok()
                    .and_then(|g| g.bookings.first().map(|b| b.window.end));
                end.map(|end| (SlotWindow::new(e.key().date, e.key().start, end), ledger))
            })
            .collect()
    }

    /// Minimal event sequence that rebuilds current state: one schedule
    /// event per salon, then the live future bookings. Cancelled, expired,
    /// and past-dated bookings are dropped — the durable half of archival.
    async fn snapshot_events(&self) -> Vec<Event> {
        let today = date_of(self.clock.now_ms());
        let mut events = Vec::new();

        for entry in self.salons.iter() {
            let state = entry.value().state.read().await.clone();
            events.push(Event::schedule_set(state.id, &state.schedule, state.version));
        }

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            for b in &guard.bookings {
                if b.window.date < today {
                    continue;
                }
                match b.status {
                    BookingStatus::Requested => {
                        events.push(Event::booking_requested(b));
                    }
                    BookingStatus::Confirmed => {
                        events.push(Event::booking_requested(b));
                        events.push(Event::BookingConfirmed {
                            id: b.id,
                            salon_id: b.salon_id,
                        });
                    }
                    BookingStatus::Cancelled | BookingStatus::Expired => {}
                }
            }
        }

        events
    }

    /// Rewrite the WAL down to a snapshot of current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        info!(events = count, "WAL compacted");
        Ok(())
    }

    /// Appends since the last compaction, for threshold-triggered compaction.
    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }
}

fn record_reserve_outcome(outcome: &'static str) {
    metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}
