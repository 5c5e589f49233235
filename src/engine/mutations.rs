use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{validate, Engine, EngineError, WalCommand};

impl Engine {
    /// Claim a slot for `user_id` on the request's date.
    ///
    /// The slot check, the one-per-day check and both writes happen under the
    /// user lock and the floor-day lock, and commit as a single WAL record:
    /// of two concurrent calls for the same slot exactly one succeeds.
    pub async fn reserve_slot(
        &self,
        user_id: &str,
        req: ReservationRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        validate::reservation(&self.layout, &req, now)?;

        let _gate = self.commit_gate.read().await;
        let mut user = self.user_or_create(user_id)?.write_owned().await;
        // An absent floor-day means the slot is free, so the user checks can
        // run first without changing which error wins.
        if !self.has_floor_day(&req.floor, req.date) {
            admit_reservation(&user, req.date)?;
        }
        let mut floor = self.floor_day(&req.floor, req.date)?.write_owned().await;

        if floor.status(req.slot) != Some(SlotStatus::Available) {
            metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "unavailable")
                .increment(1);
            return Err(EngineError::SlotUnavailable {
                floor: req.floor,
                slot: req.slot,
                date: req.date,
            });
        }
        admit_reservation(&user, req.date)?;

        let reservation = Reservation {
            user_id: user_id.to_string(),
            floor: req.floor,
            slot: req.slot,
            date: req.date,
            window: TimeWindow::new(req.start, req.end),
            plate: req.plate.trim().to_string(),
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(Some(&mut *user), Some(&mut *floor), &event)
            .await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "created")
            .increment(1);
        Ok(reservation)
    }

    /// Release the slot held for `date`, then delete the reservation.
    pub async fn cancel_reservation(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Reservation, EngineError> {
        let _gate = self.commit_gate.read().await;
        let user = self.user(user_id).ok_or(EngineError::NoReservation(date))?;
        let mut user = user.write_owned().await;
        let reservation = user
            .reservations
            .get(&date)
            .cloned()
            .ok_or(EngineError::NoReservation(date))?;
        let mut floor = self
            .floor_day_entry(&reservation.floor, date)
            .write_owned()
            .await;

        let event = Event::ReservationCancelled {
            user_id: user_id.to_string(),
            date,
            floor: reservation.floor.clone(),
            slot: reservation.slot,
        };
        self.persist_and_apply(Some(&mut *user), Some(&mut *floor), &event)
            .await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "cancelled")
            .increment(1);
        Ok(reservation)
    }

    /// Every `(user, date)` whose reservation has expired at `now`.
    /// Users locked by a writer are skipped and picked up on the next sweep.
    pub fn collect_expired(&self, now: NaiveDateTime) -> Vec<(UserId, NaiveDate)> {
        let mut expired = Vec::new();
        for entry in self.users.iter() {
            let us = entry.value().clone();
            if let Ok(guard) = us.try_read() {
                for (date, r) in &guard.reservations {
                    if r.is_expired(now) {
                        expired.push((guard.id.clone(), *date));
                    }
                }
            }
        }
        expired
    }

    /// Release an expired reservation. Expiry is checked again under the
    /// lock; returns `false` when there was nothing to reclaim.
    pub async fn expire_reservation(
        &self,
        user_id: &str,
        date: NaiveDate,
        now: NaiveDateTime,
    ) -> Result<bool, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(user) = self.user(user_id) else {
            return Ok(false);
        };
        let mut user = user.write_owned().await;
        let Some(reservation) = user.reservations.get(&date).cloned() else {
            return Ok(false);
        };
        if !reservation.is_expired(now) {
            return Ok(false);
        }
        let mut floor = self
            .floor_day_entry(&reservation.floor, date)
            .write_owned()
            .await;

        let event = Event::ReservationExpired {
            user_id: user_id.to_string(),
            date,
            floor: reservation.floor.clone(),
            slot: reservation.slot,
        };
        self.persist_and_apply(Some(&mut *user), Some(&mut *floor), &event)
            .await?;
        metrics::counter!(crate::observability::RESERVATIONS_EXPIRED_TOTAL).increment(1);
        info!(
            user = user_id,
            floor = %reservation.floor,
            slot = %reservation.slot,
            date = %format_date(date),
            "reservation expired"
        );
        Ok(true)
    }

    /// Reclaim one user's expired reservations. Returns how many were released.
    pub async fn sweep_user(&self, user_id: &str, now: NaiveDateTime) -> Result<usize, EngineError> {
        let Some(user) = self.user(user_id) else {
            return Ok(0);
        };
        let dates: Vec<NaiveDate> = user
            .read()
            .await
            .reservations
            .iter()
            .filter(|(_, r)| r.is_expired(now))
            .map(|(d, _)| *d)
            .collect();

        let mut released = 0;
        for date in dates {
            if self.expire_reservation(user_id, date, now).await? {
                released += 1;
            }
        }
        Ok(released)
    }

    /// Write `new` only if the slot currently holds `expected`.
    pub async fn compare_and_set_slot(
        &self,
        floor: &str,
        slot: SlotNo,
        date: NaiveDate,
        expected: SlotStatus,
        new: SlotStatus,
    ) -> Result<(), EngineError> {
        validate::floor_and_slot(&self.layout, floor, slot)?;

        let _gate = self.commit_gate.read().await;
        if !self.has_floor_day(floor, date) {
            if expected != SlotStatus::Available {
                return Err(EngineError::StatusMismatch {
                    expected,
                    actual: SlotStatus::Available,
                });
            }
            if new == SlotStatus::Available {
                return Ok(());
            }
        }
        let mut fd = self.floor_day(floor, date)?.write_owned().await;
        let actual = fd.status(slot).ok_or(EngineError::UnknownSlot(slot))?;
        if actual != expected {
            return Err(EngineError::StatusMismatch { expected, actual });
        }
        if actual == new {
            return Ok(());
        }

        let event = Event::SlotStatusSet {
            floor: floor.to_string(),
            slot,
            date,
            status: new,
        };
        self.persist_and_apply(None, Some(&mut *fd), &event).await
    }

    /// Register a profile, or overwrite the supplied fields of an existing one.
    pub async fn put_profile(
        &self,
        user_id: &str,
        fields: ProfileFields,
    ) -> Result<UserProfile, EngineError> {
        validate::profile_fields(&fields)?;

        let _gate = self.commit_gate.read().await;
        let mut user = self.user_or_create(user_id)?.write_owned().await;

        let event = match &user.profile {
            Some(_) => Event::ProfileUpdated {
                user_id: user_id.to_string(),
                fields,
            },
            None => {
                let (Some(username), Some(email), Some(phone)) =
                    (fields.username, fields.email, fields.phone)
                else {
                    return Err(EngineError::Validation(
                        "username, email and phone are required to register",
                    ));
                };
                Event::ProfileRegistered {
                    user_id: user_id.to_string(),
                    profile: UserProfile {
                        username,
                        email,
                        phone,
                        notifications: fields.notifications.unwrap_or(true),
                    },
                }
            }
        };
        self.persist_and_apply(Some(&mut *user), None, &event).await?;
        user.profile.clone().ok_or(EngineError::ProfileNotFound)
    }

    pub async fn add_vehicle(
        &self,
        user_id: &str,
        brand: &str,
        model: &str,
        plate: &str,
    ) -> Result<Vehicle, EngineError> {
        validate::vehicle(brand, model, plate)?;

        let _gate = self.commit_gate.read().await;
        let mut user = self.user_or_create(user_id)?.write_owned().await;
        if user.vehicles.len() >= MAX_VEHICLES_PER_USER {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }

        let vehicle = Vehicle {
            id: Ulid::new(),
            brand: brand.trim().to_string(),
            model: model.trim().to_string(),
            plate: plate.trim().to_string(),
        };
        let event = Event::VehicleAdded {
            user_id: user_id.to_string(),
            vehicle: vehicle.clone(),
        };
        self.persist_and_apply(Some(&mut *user), None, &event).await?;
        Ok(vehicle)
    }

    pub async fn remove_vehicle(&self, user_id: &str, vehicle_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let not_found = || EngineError::VehicleNotFound(vehicle_id.to_string());
        let user = self.user(user_id).ok_or_else(not_found)?;
        let mut user = user.write_owned().await;
        if !user.vehicles.iter().any(|v| v.id == vehicle_id) {
            return Err(not_found());
        }

        let event = Event::VehicleRemoved {
            user_id: user_id.to_string(),
            vehicle_id,
        };
        self.persist_and_apply(Some(&mut *user), None, &event).await
    }

    /// Forget floor-days before `before` whose slots are all available.
    /// They are indistinguishable from never-touched inventory.
    pub async fn prune_floor_days(&self, before: NaiveDate) -> usize {
        let _gate = self.commit_gate.write().await;
        let len = self.floors.len();
        self.floors.retain(|(_, date), fd| {
            *date >= before
                || fd
                    .try_read()
                    .map(|g| g.available_count() < g.slots.len())
                    .unwrap_or(true)
        });
        len - self.floors.len()
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();
        // Slots a replayed reservation will mark reserved on its own.
        let mut claimed: HashSet<(String, NaiveDate, SlotNo)> = HashSet::new();

        let users: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        for us in users {
            let us = us.read().await;
            if us.is_empty() {
                continue;
            }
            if let Some(profile) = &us.profile {
                events.push(Event::ProfileRegistered {
                    user_id: us.id.clone(),
                    profile: profile.clone(),
                });
            }
            for vehicle in &us.vehicles {
                events.push(Event::VehicleAdded {
                    user_id: us.id.clone(),
                    vehicle: vehicle.clone(),
                });
            }
            for r in us.reservations.values() {
                claimed.insert((r.floor.clone(), r.date, r.slot));
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }

        let floors: Vec<_> = self.floors.iter().map(|e| e.value().clone()).collect();
        for fd in floors {
            let fd = fd.read().await;
            for (slot, status) in fd.iter() {
                let implied = if claimed.contains(&(fd.floor.clone(), fd.date, slot)) {
                    SlotStatus::Reserved
                } else {
                    SlotStatus::Available
                };
                if status != implied {
                    events.push(Event::SlotStatusSet {
                        floor: fd.floor.clone(),
                        slot,
                        date: fd.date,
                        status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// One reservation per user per date, and at most `MAX_RESERVATIONS_PER_USER`.
fn admit_reservation(user: &UserState, date: NaiveDate) -> Result<(), EngineError> {
    if user.reservations.contains_key(&date) {
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => "duplicate")
            .increment(1);
        return Err(EngineError::DuplicateReservation(date));
    }
    if user.reservations.len() >= MAX_RESERVATIONS_PER_USER {
        return Err(EngineError::LimitExceeded("too many reservations"));
    }
    Ok(())
}
