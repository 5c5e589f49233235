use chrono::NaiveDateTime;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Non-blank and bounded.
pub(crate) fn text(value: &str, blank: &'static str, too_long: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(blank));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(EngineError::LimitExceeded(too_long));
    }
    Ok(())
}

pub(crate) fn floor_and_slot(layout: &FloorLayout, floor: &str, slot: SlotNo) -> Result<(), EngineError> {
    if !layout.has_floor(floor) {
        return Err(EngineError::UnknownFloor(floor.to_string()));
    }
    if !layout.has_slot(slot) {
        return Err(EngineError::UnknownSlot(slot));
    }
    Ok(())
}

pub(crate) fn reservation(
    layout: &FloorLayout,
    req: &ReservationRequest,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    floor_and_slot(layout, &req.floor, req.slot)?;
    text(&req.plate, "plate must not be blank", "plate too long")?;
    if req.start >= req.end {
        return Err(EngineError::Validation("start time must be before end time"));
    }
    let today = now.date();
    if req.date < today {
        return Err(EngineError::Validation("date is in the past"));
    }
    if req.date == today && TimeWindow::new(req.start, req.end).ended_by(now.time()) {
        return Err(EngineError::Validation("time window has already ended"));
    }
    Ok(())
}

fn email(value: &str) -> Result<(), EngineError> {
    text(value, "email must not be blank", "email too long")?;
    if !value.contains('@') {
        return Err(EngineError::Validation("email must contain '@'"));
    }
    Ok(())
}

fn phone(value: &str) -> Result<(), EngineError> {
    if value.len() != PHONE_DIGITS || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::Validation("phone must be exactly 11 digits"));
    }
    Ok(())
}

/// Checks only the supplied fields.
pub(crate) fn profile_fields(fields: &ProfileFields) -> Result<(), EngineError> {
    if fields.is_empty() {
        return Err(EngineError::Validation("no profile fields supplied"));
    }
    if let Some(u) = &fields.username {
        text(u, "username must not be blank", "username too long")?;
    }
    if let Some(e) = &fields.email {
        email(e)?;
    }
    if let Some(p) = &fields.phone {
        phone(p)?;
    }
    Ok(())
}

pub(crate) fn vehicle(brand: &str, model: &str, plate: &str) -> Result<(), EngineError> {
    text(brand, "brand must not be blank", "brand too long")?;
    text(model, "model must not be blank", "model too long")?;
    text(plate, "plate must not be blank", "plate too long")
}
