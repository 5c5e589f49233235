use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Auth-provider UID. Taken verbatim from the connection's startup user.
pub type UserId = String;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M";

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Drop seconds and below: expiry is decided at `HH:mm` resolution.
pub fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt(t.hour(), t.minute(), 0).unwrap_or(t)
}

/// Which floors exist and how many slots each has.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloorLayout {
    pub floors: Vec<String>,
    pub slots_per_floor: u32,
}

impl Default for FloorLayout {
    fn default() -> Self {
        Self {
            floors: (1..=4).map(|i| format!("floor{i}")).collect(),
            slots_per_floor: 10,
        }
    }
}

impl FloorLayout {
    pub fn has_floor(&self, floor: &str) -> bool {
        self.floors.iter().any(|f| f == floor)
    }

    pub fn has_slot(&self, slot: SlotNo) -> bool {
        slot.0 >= 1 && slot.0 <= self.slots_per_floor
    }
}

/// 1-based slot number, rendered `slot{n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotNo(pub u32);

impl fmt::Display for SlotNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

impl FromStr for SlotNo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix("slot").unwrap_or(s);
        match digits.parse::<u32>() {
            Ok(n) if n > 0 => Ok(SlotNo(n)),
            _ => Err(format!("bad slot id: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Reserved,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "available",
            SlotStatus::Reserved => "reserved",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "available" => Ok(SlotStatus::Available),
            // older clients wrote "occupied"
            "reserved" | "occupied" => Ok(SlotStatus::Reserved),
            other => Err(format!("bad slot status: {other}")),
        }
    }
}

/// `[start, end]` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    /// True once the wall clock, at minute resolution, is strictly past `end`.
    pub fn ended_by(&self, now: NaiveTime) -> bool {
        truncate_to_minute(now) > self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub user_id: UserId,
    pub floor: String,
    pub slot: SlotNo,
    pub date: NaiveDate,
    pub window: TimeWindow,
    pub plate: String,
}

impl Reservation {
    /// Expired when its day is over, or it is today and the window has ended.
    pub fn is_expired(&self, now: NaiveDateTime) -> bool {
        let today = now.date();
        self.date < today || (self.date == today && self.window.ended_by(now.time()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "floor": self.floor,
            "slotId": self.slot.to_string(),
            "startTime": format_time(self.window.start),
            "endTime": format_time(self.window.end),
            "plate": self.plate,
            "date": format_date(self.date),
        })
    }
}

/// Unvalidated reserve input as it arrives from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub floor: String,
    pub slot: SlotNo,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub plate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    /// Push key under `users/{uid}/vehicles`.
    pub id: Ulid,
    pub brand: String,
    pub model: String,
    pub plate: String,
}

impl Vehicle {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "brand": self.brand,
            "model": self.model,
            "plate": self.plate,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub username: String,
    pub email: String,
    pub phone: String,
    pub notifications: bool,
}

/// Partial profile write. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFields {
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notifications: Option<bool>,
}

impl ProfileFields {
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.email.is_none()
            && self.phone.is_none()
            && self.notifications.is_none()
    }

    pub fn apply_to(&self, profile: &mut UserProfile) {
        if let Some(u) = &self.username {
            profile.username = u.clone();
        }
        if let Some(e) = &self.email {
            profile.email = e.clone();
        }
        if let Some(p) = &self.phone {
            profile.phone = p.clone();
        }
        if let Some(n) = self.notifications {
            profile.notifications = n;
        }
    }
}

/// Slot inventory for one floor on one date. Every slot starts out available.
#[derive(Debug, Clone)]
pub struct FloorDay {
    pub floor: String,
    pub date: NaiveDate,
    /// Index `i` holds the status of `SlotNo(i + 1)`.
    pub slots: Vec<SlotStatus>,
}

impl FloorDay {
    pub fn new(floor: String, date: NaiveDate, slot_count: u32) -> Self {
        Self {
            floor,
            date,
            slots: vec![SlotStatus::Available; slot_count as usize],
        }
    }

    pub fn status(&self, slot: SlotNo) -> Option<SlotStatus> {
        let idx = (slot.0 as usize).checked_sub(1)?;
        self.slots.get(idx).copied()
    }

    pub fn set_status(&mut self, slot: SlotNo, status: SlotStatus) {
        if let Some(idx) = (slot.0 as usize).checked_sub(1)
            && let Some(s) = self.slots.get_mut(idx)
        {
            *s = status;
        }
    }

    pub fn available_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| **s == SlotStatus::Available)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotNo, SlotStatus)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (SlotNo(i as u32 + 1), *s))
    }
}

/// Everything stored under one user: profile, reservations by date, vehicles.
#[derive(Debug, Clone)]
pub struct UserState {
    pub id: UserId,
    pub profile: Option<UserProfile>,
    pub reservations: BTreeMap<NaiveDate, Reservation>,
    pub vehicles: Vec<Vehicle>,
}

impl UserState {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            profile: None,
            reservations: BTreeMap::new(),
            vehicles: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && self.reservations.is_empty() && self.vehicles.is_empty()
    }
}

/// WAL record format. One flat enum, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileRegistered {
        user_id: UserId,
        profile: UserProfile,
    },
    ProfileUpdated {
        user_id: UserId,
        fields: ProfileFields,
    },
    VehicleAdded {
        user_id: UserId,
        vehicle: Vehicle,
    },
    VehicleRemoved {
        user_id: UserId,
        vehicle_id: Ulid,
    },
    /// Claims the slot and writes the reservation in one record.
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationCancelled {
        user_id: UserId,
        date: NaiveDate,
        floor: String,
        slot: SlotNo,
    },
    ReservationExpired {
        user_id: UserId,
        date: NaiveDate,
        floor: String,
        slot: SlotNo,
    },
    SlotStatusSet {
        floor: String,
        slot: SlotNo,
        date: NaiveDate,
        status: SlotStatus,
    },
}

impl Event {
    /// The user subtree this event touches, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Event::ProfileRegistered { user_id, .. }
            | Event::ProfileUpdated { user_id, .. }
            | Event::VehicleAdded { user_id, .. }
            | Event::VehicleRemoved { user_id, .. }
            | Event::ReservationCancelled { user_id, .. }
            | Event::ReservationExpired { user_id, .. } => Some(user_id),
            Event::ReservationCreated { reservation } => Some(&reservation.user_id),
            Event::SlotStatusSet { .. } => None,
        }
    }

    /// The `(floor, date)` inventory this event touches, if any.
    pub fn floor_day(&self) -> Option<(&str, NaiveDate)> {
        match self {
            Event::ReservationCreated { reservation } => {
                Some((&reservation.floor, reservation.date))
            }
            Event::ReservationCancelled { floor, date, .. }
            | Event::ReservationExpired { floor, date, .. }
            | Event::SlotStatusSet { floor, date, .. } => Some((floor, *date)),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub floor: String,
    pub slot: SlotNo,
    pub date: NaiveDate,
    pub status: SlotStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloorCount {
    pub floor: String,
    pub available: usize,
}
