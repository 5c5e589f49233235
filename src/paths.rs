//! The document path layout clients observe:
//!
//! ```text
//! slots/{floor}/{slotId}/{date}/status
//! reservations/{userId}/{date}
//! users/{userId}/{username|email|phone|notifications}
//! users/{userId}/vehicles/{pushKey}
//! ```
//!
//! Every change notification names one of these paths and carries the new
//! JSON value at it (`null` when the value was removed).

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Username,
    Email,
    Phone,
    Notifications,
}

impl ProfileField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileField::Username => "username",
            ProfileField::Email => "email",
            ProfileField::Phone => "phone",
            ProfileField::Notifications => "notifications",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "username" => Some(ProfileField::Username),
            "email" => Some(ProfileField::Email),
            "phone" => Some(ProfileField::Phone),
            "notifications" => Some(ProfileField::Notifications),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocPath {
    SlotStatus {
        floor: String,
        slot: SlotNo,
        date: NaiveDate,
    },
    Reservation {
        user_id: UserId,
        date: NaiveDate,
    },
    Profile {
        user_id: UserId,
        field: ProfileField,
    },
    Vehicle {
        user_id: UserId,
        vehicle_id: Ulid,
    },
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocPath::SlotStatus { floor, slot, date } => {
                write!(f, "slots/{floor}/{slot}/{}/status", format_date(*date))
            }
            DocPath::Reservation { user_id, date } => {
                write!(f, "reservations/{user_id}/{}", format_date(*date))
            }
            DocPath::Profile { user_id, field } => {
                write!(f, "users/{user_id}/{}", field.as_str())
            }
            DocPath::Vehicle { user_id, vehicle_id } => {
                write!(f, "users/{user_id}/vehicles/{vehicle_id}")
            }
        }
    }
}

impl FromStr for DocPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_matches('/').split('/').collect();
        let bad = || format!("unrecognised path: {s}");
        let date = |p: &str| parse_date(p).ok_or_else(|| format!("bad date in path: {p}"));

        match parts.as_slice() {
            ["slots", floor, slot, d, "status"] => Ok(DocPath::SlotStatus {
                floor: floor.to_string(),
                slot: slot.parse()?,
                date: date(*d)?,
            }),
            ["reservations", user, d] => Ok(DocPath::Reservation {
                user_id: user.to_string(),
                date: date(*d)?,
            }),
            ["users", user, "vehicles", key] => Ok(DocPath::Vehicle {
                user_id: user.to_string(),
                vehicle_id: Ulid::from_string(*key).map_err(|e| format!("bad push key: {e}"))?,
            }),
            ["users", user, field] => Ok(DocPath::Profile {
                user_id: user.to_string(),
                field: ProfileField::parse(field).ok_or_else(bad)?,
            }),
            _ => Err(bad()),
        }
    }
}

/// One path-level write, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub path: String,
    pub value: Value,
    /// Publish order within a site, stamped by the hub.
    #[serde(skip)]
    pub seq: u64,
}

impl Change {
    pub fn new(path: DocPath, value: Value) -> Self {
        Self {
            path: path.to_string(),
            value,
            seq: 0,
        }
    }

    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"path\":\"{}\"}}", self.path))
    }
}

/// Channel carrying slot status changes for a floor (any date).
pub fn floor_channel(floor: &str) -> String {
    format!("slots_{floor}")
}

/// Channel carrying reservation, profile and vehicle changes for one user.
pub fn user_channel(user_id: &str) -> String {
    format!("user_{user_id}")
}

/// Expand an event into the path writes it performs, paired with the channel
/// each write is published on. Slot writes precede reservation writes.
pub fn event_changes(event: &Event) -> Vec<(String, Change)> {
    let slot_change = |floor: &str, slot: SlotNo, date: NaiveDate, status: SlotStatus| {
        (
            floor_channel(floor),
            Change::new(
                DocPath::SlotStatus {
                    floor: floor.to_string(),
                    slot,
                    date,
                },
                Value::from(status.as_str()),
            ),
        )
    };
    let reservation_change = |user_id: &str, date: NaiveDate, value: Value| {
        (
            user_channel(user_id),
            Change::new(
                DocPath::Reservation {
                    user_id: user_id.to_string(),
                    date,
                },
                value,
            ),
        )
    };
    let profile_change = |user_id: &str, field: ProfileField, value: Value| {
        (
            user_channel(user_id),
            Change::new(
                DocPath::Profile {
                    user_id: user_id.to_string(),
                    field,
                },
                value,
            ),
        )
    };

    match event {
        Event::ReservationCreated { reservation: r } => vec![
            slot_change(&r.floor, r.slot, r.date, SlotStatus::Reserved),
            reservation_change(&r.user_id, r.date, r.to_json()),
        ],
        Event::ReservationCancelled { user_id, date, floor, slot }
        | Event::ReservationExpired { user_id, date, floor, slot } => vec![
            slot_change(floor, *slot, *date, SlotStatus::Available),
            reservation_change(user_id, *date, Value::Null),
        ],
        Event::SlotStatusSet { floor, slot, date, status } => {
            vec![slot_change(floor, *slot, *date, *status)]
        }
        Event::ProfileRegistered { user_id, profile } => vec![
            profile_change(user_id, ProfileField::Username, Value::from(profile.username.clone())),
            profile_change(user_id, ProfileField::Email, Value::from(profile.email.clone())),
            profile_change(user_id, ProfileField::Phone, Value::from(profile.phone.clone())),
            profile_change(user_id, ProfileField::Notifications, Value::from(profile.notifications)),
        ],
        Event::ProfileUpdated { user_id, fields } => {
            let mut out = Vec::new();
            if let Some(u) = &fields.username {
                out.push(profile_change(user_id, ProfileField::Username, Value::from(u.clone())));
            }
            if let Some(e) = &fields.email {
                out.push(profile_change(user_id, ProfileField::Email, Value::from(e.clone())));
            }
            if let Some(p) = &fields.phone {
                out.push(profile_change(user_id, ProfileField::Phone, Value::from(p.clone())));
            }
            if let Some(n) = fields.notifications {
                out.push(profile_change(user_id, ProfileField::Notifications, Value::from(n)));
            }
            out
        }
        Event::VehicleAdded { user_id, vehicle } => vec![(
            user_channel(user_id),
            Change::new(
                DocPath::Vehicle {
                    user_id: user_id.clone(),
                    vehicle_id: vehicle.id,
                },
                vehicle.to_json(),
            ),
        )],
        Event::VehicleRemoved { user_id, vehicle_id } => vec![(
            user_channel(user_id),
            Change::new(
                DocPath::Vehicle {
                    user_id: user_id.clone(),
                    vehicle_id: *vehicle_id,
                },
                Value::Null,
            ),
        )],
    }
}
