mod error;
mod mutations;
mod queries;
mod validate;

pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

use crate::limits::*;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedUser = Arc<RwLock<UserState>>;
pub type SharedFloorDay = Arc<RwLock<FloorDay>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush is
/// in progress are committed together with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_control(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let deferred = drain_appends(&mut rx, &mut batch);
        commit_batch(&mut wal, &mut batch);

        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

/// Pull every append already queued. Stops at the first control command,
/// which must run after the batch is on disk.
fn drain_appends(
    rx: &mut mpsc::Receiver<WalCommand>,
    batch: &mut Vec<PendingAppend>,
) -> Option<WalCommand> {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WalCommand::Append { event, response } => batch.push((event, response)),
            other => return Some(other),
        }
    }
    None
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes are not
    // attributed to the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let _ = tx.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => {}
    }
}

/// Slot inventory, reservations, profiles and vehicles for one site.
///
/// Lock order is always: commit gate, user, floor-day.
pub struct Engine {
    pub(super) users: DashMap<UserId, SharedUser>,
    pub(super) floors: DashMap<(String, NaiveDate), SharedFloorDay>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation and exclusively by compaction and
    /// pruning, so a snapshot never misses an in-flight write.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
    pub layout: FloorLayout,
}

/// Apply an event to a user subtree (caller holds the lock).
fn apply_to_user(us: &mut UserState, event: &Event) {
    match event {
        Event::ProfileRegistered { profile, .. } => us.profile = Some(profile.clone()),
        Event::ProfileUpdated { fields, .. } => {
            if let Some(profile) = us.profile.as_mut() {
                fields.apply_to(profile);
            }
        }
        Event::VehicleAdded { vehicle, .. } => us.vehicles.push(vehicle.clone()),
        Event::VehicleRemoved { vehicle_id, .. } => us.vehicles.retain(|v| v.id != *vehicle_id),
        Event::ReservationCreated { reservation } => {
            us.reservations.insert(reservation.date, reservation.clone());
        }
        Event::ReservationCancelled { date, .. } | Event::ReservationExpired { date, .. } => {
            us.reservations.remove(date);
        }
        Event::SlotStatusSet { .. } => {}
    }
}

/// Apply an event to a floor-day inventory (caller holds the lock).
fn apply_to_floor(fd: &mut FloorDay, event: &Event) {
    match event {
        Event::ReservationCreated { reservation } => {
            fd.set_status(reservation.slot, SlotStatus::Reserved)
        }
        Event::ReservationCancelled { slot, .. } | Event::ReservationExpired { slot, .. } => {
            fd.set_status(*slot, SlotStatus::Available)
        }
        Event::SlotStatusSet { slot, status, .. } => fd.set_status(*slot, *status),
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_layout(wal_path, notify, FloorLayout::default())
    }

    pub fn with_layout(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        layout: FloorLayout,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                path = %wal_path.display(),
                bytes = replay.discarded_bytes,
                "discarding torn WAL tail"
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Rebuild plain state first and wrap it in locks once at the end.
        let mut users: HashMap<UserId, UserState> = HashMap::new();
        let mut floors: HashMap<(String, NaiveDate), FloorDay> = HashMap::new();
        for event in &replay.events {
            if let Some((floor, date)) = event.floor_day() {
                let fd = floors
                    .entry((floor.to_string(), date))
                    .or_insert_with(|| FloorDay::new(floor.to_string(), date, layout.slots_per_floor));
                apply_to_floor(fd, event);
            }
            if let Some(user_id) = event.user_id() {
                let us = users
                    .entry(user_id.to_string())
                    .or_insert_with(|| UserState::new(user_id.to_string()));
                apply_to_user(us, event);
            }
        }

        Ok(Self {
            users: users
                .into_iter()
                .map(|(id, us)| (id, Arc::new(RwLock::new(us))))
                .collect(),
            floors: floors
                .into_iter()
                .map(|(key, fd)| (key, Arc::new(RwLock::new(fd))))
                .collect(),
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
            layout,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// WAL-append, then apply (slot inventory first), then notify.
    pub(super) async fn persist_and_apply(
        &self,
        user: Option<&mut UserState>,
        floor: Option<&mut FloorDay>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        if let Some(fd) = floor {
            apply_to_floor(fd, event);
        }
        if let Some(us) = user {
            apply_to_user(us, event);
        }
        self.notify.publish(event);
        Ok(())
    }

    pub fn user(&self, user_id: &str) -> Option<SharedUser> {
        self.users.get(user_id).map(|e| e.value().clone())
    }

    pub(super) fn user_or_create(&self, user_id: &str) -> Result<SharedUser, EngineError> {
        if let Some(us) = self.user(user_id) {
            return Ok(us);
        }
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("user id must not be blank"));
        }
        if user_id.len() > MAX_USER_ID_LEN {
            return Err(EngineError::LimitExceeded("user id too long"));
        }
        if self.users.len() >= MAX_USERS_PER_SITE {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let entry = self
            .users
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(UserState::new(user_id.to_string()))));
        Ok(entry.value().clone())
    }

    /// Inventory for a configured floor on `date`, created on first use.
    pub(super) fn floor_day(&self, floor: &str, date: NaiveDate) -> Result<SharedFloorDay, EngineError> {
        if !self.layout.has_floor(floor) {
            return Err(EngineError::UnknownFloor(floor.to_string()));
        }
        Ok(self.floor_day_entry(floor, date))
    }

    /// Like `floor_day` but without the layout check. Releases use this so a
    /// reservation made before a layout change can still be cancelled.
    pub(super) fn floor_day_entry(&self, floor: &str, date: NaiveDate) -> SharedFloorDay {
        self.floors
            .entry((floor.to_string(), date))
            .or_insert_with(|| {
                Arc::new(RwLock::new(FloorDay::new(
                    floor.to_string(),
                    date,
                    self.layout.slots_per_floor,
                )))
            })
            .value()
            .clone()
    }

    /// Whether `(floor, date)` has been materialised. An absent floor-day
    /// has every slot available.
    pub(super) fn has_floor_day(&self, floor: &str, date: NaiveDate) -> bool {
        self.floors.contains_key(&(floor.to_string(), date))
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
