use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::clock::date_of;
use crate::limits::MAX_BOOKING_HORIZON_DAYS;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Availability for a salon on a date: every window the current schedule
    /// generates, with its remaining capacity at this instant. Remaining
    /// counts lapsed holds as free even before the sweeper expires them.
    pub async fn availability(
        &self,
        salon_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let salon = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        let schedule = salon.state.read().await.schedule.clone();

        let now = self.clock.now_ms();
        let today = date_of(now);
        if date < today || date > today + Days::new(MAX_BOOKING_HORIZON_DAYS) {
            return Err(EngineError::InvalidDate);
        }

        let capacity = schedule.max_bookings_per_slot;
        let mut out = Vec::new();
        for window in super::slots::generate(&schedule, date) {
            let active = match self.get_ledger(&window.key(salon_id)) {
                Some(ledger) => ledger.read().await.active_count(now),
                None => 0,
            };
            out.push(SlotAvailability {
                window,
                remaining: capacity.saturating_sub(active),
            });
        }
        Ok(out)
    }

    /// Current schedule and version of a salon.
    pub async fn get_schedule(&self, salon_id: Ulid) -> Result<(SalonSchedule, u64), EngineError> {
        let salon = self
            .get_salon(&salon_id)
            .ok_or(EngineError::NotFound(salon_id))?;
        let state = salon.state.read().await;
        Ok((state.schedule.clone(), state.version))
    }

    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let key = self
            .booking_key(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let ledger = self
            .get_ledger(&key)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = ledger.read().await;
        guard
            .find(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))
    }

    /// All bookings of one salon, ordered by window then creation.
    pub async fn list_bookings(&self, salon_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        if self.get_salon(&salon_id).is_none() {
            return Err(EngineError::NotFound(salon_id));
        }
        let ledgers: Vec<_> = self
            .ledgers
            .iter()
            .filter(|e| e.key().salon_id == salon_id)
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for ledger in ledgers {
            out.extend(ledger.read().await.bookings.iter().cloned());
        }
        out.sort_by(|a, b| {
            (a.window, a.created_at, a.id).cmp(&(b.window, b.created_at, b.id))
        });
        Ok(out)
    }

    /// All bookings a customer holds, across every salon.
    pub async fn list_customer_bookings(&self, customer_id: Ulid) -> Vec<Booking> {
        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for ledger in ledgers {
            out.extend(
                ledger
                    .read()
                    .await
                    .bookings
                    .iter()
                    .filter(|b| b.customer_id == customer_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| (a.window, a.created_at, a.id).cmp(&(b.window, b.created_at, b.id)));
        out
    }
}
