use chrono::NaiveDate;
use serde_json::Value;

use crate::model::*;
use crate::paths::{DocPath, ProfileField};

use super::{Engine, EngineError};

impl Engine {
    /// Current inventory for a floor-day without materialising it.
    async fn floor_snapshot(&self, floor: &str, date: NaiveDate) -> Result<FloorDay, EngineError> {
        if !self.layout.has_floor(floor) {
            return Err(EngineError::UnknownFloor(floor.to_string()));
        }
        let existing = self
            .floors
            .get(&(floor.to_string(), date))
            .map(|e| e.value().clone());
        Ok(match existing {
            Some(fd) => fd.read().await.clone(),
            None => FloorDay::new(floor.to_string(), date, self.layout.slots_per_floor),
        })
    }

    pub async fn slot_statuses(&self, floor: &str, date: NaiveDate) -> Result<Vec<SlotInfo>, EngineError> {
        let fd = self.floor_snapshot(floor, date).await?;
        Ok(fd
            .iter()
            .map(|(slot, status)| SlotInfo {
                floor: fd.floor.clone(),
                slot,
                date,
                status,
            })
            .collect())
    }

    pub async fn available_count(&self, floor: &str, date: NaiveDate) -> Result<usize, EngineError> {
        Ok(self.floor_snapshot(floor, date).await?.available_count())
    }

    /// Available slots per configured floor, in layout order.
    pub async fn floor_counts(&self, date: NaiveDate) -> Vec<FloorCount> {
        let mut counts = Vec::with_capacity(self.layout.floors.len());
        for floor in &self.layout.floors {
            if let Ok(available) = self.available_count(floor, date).await {
                counts.push(FloorCount {
                    floor: floor.clone(),
                    available,
                });
            }
        }
        counts
    }

    /// All of a user's reservations, ordered by date.
    pub async fn reservations_for(&self, user_id: &str) -> Vec<Reservation> {
        match self.user(user_id) {
            Some(us) => us.read().await.reservations.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn reservation(&self, user_id: &str, date: NaiveDate) -> Option<Reservation> {
        let us = self.user(user_id)?;
        let guard = us.read().await;
        guard.reservations.get(&date).cloned()
    }

    /// Today's reservation, then the earliest one after today.
    pub async fn upcoming(&self, user_id: &str, today: NaiveDate) -> Vec<Reservation> {
        let Some(us) = self.user(user_id) else {
            return Vec::new();
        };
        let guard = us.read().await;
        let mut out = Vec::with_capacity(2);
        if let Some(r) = guard.reservations.get(&today) {
            out.push(r.clone());
        }
        if let Some((_, r)) = guard.reservations.range(today.succ_opt().unwrap_or(today)..).next()
            && r.date > today
        {
            out.push(r.clone());
        }
        out
    }

    pub async fn profile(&self, user_id: &str) -> Option<UserProfile> {
        let us = self.user(user_id)?;
        let guard = us.read().await;
        guard.profile.clone()
    }

    pub async fn vehicles(&self, user_id: &str) -> Vec<Vehicle> {
        match self.user(user_id) {
            Some(us) => us.read().await.vehicles.clone(),
            None => Vec::new(),
        }
    }

    /// Flattened `(path, value)` view: every materialised slot, followed by
    /// the user's own profile, vehicles and reservations.
    pub async fn documents(&self, user_id: &str) -> Vec<(String, Value)> {
        let mut slots = Vec::new();
        let floors: Vec<_> = self.floors.iter().map(|e| e.value().clone()).collect();
        for fd in floors {
            let fd = fd.read().await;
            for (slot, status) in fd.iter() {
                let path = DocPath::SlotStatus {
                    floor: fd.floor.clone(),
                    slot,
                    date: fd.date,
                };
                slots.push(((fd.floor.clone(), fd.date, slot), path, status));
            }
        }
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out: Vec<(String, Value)> = slots
            .into_iter()
            .map(|(_, path, status)| (path.to_string(), Value::from(status.as_str())))
            .collect();

        let Some(us) = self.user(user_id) else {
            return out;
        };
        let us = us.read().await;
        let user_path = |field| DocPath::Profile {
            user_id: user_id.to_string(),
            field,
        };
        if let Some(p) = &us.profile {
            out.push((user_path(ProfileField::Username).to_string(), Value::from(p.username.clone())));
            out.push((user_path(ProfileField::Email).to_string(), Value::from(p.email.clone())));
            out.push((user_path(ProfileField::Phone).to_string(), Value::from(p.phone.clone())));
            out.push((
                user_path(ProfileField::Notifications).to_string(),
                Value::from(p.notifications),
            ));
        }
        for v in &us.vehicles {
            let path = DocPath::Vehicle {
                user_id: user_id.to_string(),
                vehicle_id: v.id,
            };
            out.push((path.to_string(), v.to_json()));
        }
        for (date, r) in &us.reservations {
            let path = DocPath::Reservation {
                user_id: user_id.to_string(),
                date: *date,
            };
            out.push((path.to_string(), r.to_json()));
        }
        out
    }
}
