use chrono::NaiveDate;

use crate::model::{format_date, SlotNo, SlotStatus};

#[derive(Debug)]
pub enum EngineError {
    UnknownFloor(String),
    UnknownSlot(SlotNo),
    SlotUnavailable {
        floor: String,
        slot: SlotNo,
        date: NaiveDate,
    },
    DuplicateReservation(NaiveDate),
    NoReservation(NaiveDate),
    StatusMismatch {
        expected: SlotStatus,
        actual: SlotStatus,
    },
    ProfileNotFound,
    VehicleNotFound(String),
    Validation(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::UnknownFloor(_)
            | EngineError::UnknownSlot(_)
            | EngineError::Validation(_) => "22023",
            EngineError::SlotUnavailable { .. } | EngineError::DuplicateReservation(_) => "23505",
            EngineError::NoReservation(_)
            | EngineError::ProfileNotFound
            | EngineError::VehicleNotFound(_) => "P0002",
            EngineError::StatusMismatch { .. } => "40001",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownFloor(floor) => write!(f, "unknown floor: {floor}"),
            EngineError::UnknownSlot(slot) => write!(f, "unknown slot: {slot}"),
            EngineError::SlotUnavailable { floor, slot, date } => {
                write!(f, "{floor}/{slot} is not available on {}", format_date(*date))
            }
            EngineError::DuplicateReservation(date) => {
                write!(f, "already holding a reservation on {}", format_date(*date))
            }
            EngineError::NoReservation(date) => {
                write!(f, "no reservation on {}", format_date(*date))
            }
            EngineError::StatusMismatch { expected, actual } => {
                write!(f, "slot status is {actual}, expected {expected}")
            }
            EngineError::ProfileNotFound => write!(f, "profile not found"),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
