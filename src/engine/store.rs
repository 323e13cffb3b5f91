use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{error, warn};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub type SharedStation = Arc<RwLock<StationState>>;
pub type SharedPerson = Arc<RwLock<PersonState>>;

/// Key used by the uniqueness indexes: names, external ids and contacts
/// compare case-insensitively with surrounding whitespace ignored.
pub(crate) fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// The in-memory ledger. Rebuilt from the WAL on start; only mutated by
/// applying committed changes.
#[derive(Default)]
pub struct LedgerStore {
    stations: DashMap<Ulid, SharedStation>,
    people: DashMap<Ulid, SharedPerson>,
    /// booking id → station id, for live stations only
    booking_index: DashMap<Ulid, Ulid>,
    station_names: DashMap<String, Ulid>,
    external_ids: DashMap<String, Ulid>,
    contacts: DashMap<String, Ulid>,
    /// Bookings of deleted stations.
    archive: DashMap<Ulid, Booking>,
}

impl LedgerStore {
    // ── Rows ─────────────────────────────────────────────────

    pub fn station_count(&self) -> usize {
        self.stations.len()
    }

    pub fn person_count(&self) -> usize {
        self.people.len()
    }

    pub fn get_station(&self, id: &Ulid) -> Option<SharedStation> {
        self.stations.get(id).map(|e| e.value().clone())
    }

    pub fn get_person(&self, id: &Ulid) -> Option<SharedPerson> {
        self.people.get(id).map(|e| e.value().clone())
    }

    pub fn station_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.stations.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn person_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.people.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    // ── Indexes ──────────────────────────────────────────────

    pub fn station_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    pub fn archived_booking(&self, booking_id: &Ulid) -> Option<Booking> {
        self.archive.get(booking_id).map(|e| e.value().clone())
    }

    pub fn archived_bookings(&self) -> Vec<Booking> {
        self.archive.iter().map(|e| e.value().clone()).collect()
    }

    pub fn person_by_external_id(&self, external_id: &str) -> Option<Ulid> {
        self.external_ids
            .get(&normalize_key(external_id))
            .map(|e| *e.value())
    }

    /// Claim a unique station name ahead of its commit. Err if taken.
    pub fn reserve_station_name(&self, name: &str, id: Ulid) -> Result<(), EngineError> {
        reserve(&self.station_names, name, id, "station name")
    }

    pub fn release_station_name(&self, name: &str, id: Ulid) {
        self.station_names
            .remove_if(&normalize_key(name), |_, owner| *owner == id);
    }

    /// Claim external id and contact together; on failure neither stays claimed.
    pub fn reserve_person_keys(
        &self,
        external_id: &str,
        contact: &str,
        id: Ulid,
    ) -> Result<(), EngineError> {
        reserve(&self.external_ids, external_id, id, "external id")?;
        if let Err(e) = reserve(&self.contacts, contact, id, "contact") {
            self.external_ids
                .remove_if(&normalize_key(external_id), |_, owner| *owner == id);
            return Err(e);
        }
        Ok(())
    }

    pub fn release_person_keys(&self, external_id: &str, contact: &str, id: Ulid) {
        self.external_ids
            .remove_if(&normalize_key(external_id), |_, owner| *owner == id);
        self.contacts
            .remove_if(&normalize_key(contact), |_, owner| *owner == id);
    }

    // ── Change application ───────────────────────────────────

    /// Apply one committed change. Rows touched by the change must already be
    /// write-locked in `rows`; creations insert fresh rows directly.
    pub fn apply(&self, rows: &mut Locked, change: &Change) {
        match change {
            Change::StationCreated { id, name, at } => {
                self.station_names.insert(normalize_key(name), *id);
                self.stations.insert(
                    *id,
                    Arc::new(RwLock::new(StationState::new(*id, name.clone(), *at))),
                );
            }
            Change::StationDeleted { id } => {
                if let Some(rs) = rows.station_mut(*id) {
                    rs.deleted = true;
                    for b in rs.bookings.drain(..) {
                        self.booking_index.remove(&b.id);
                        self.archive.insert(b.id, b);
                    }
                    self.release_station_name(&rs.station.name, *id);
                } else {
                    missing_row("station", *id, change);
                }
                self.stations.remove(id);
            }
            Change::StationUpdated { id, status, occupant, at } => {
                if let Some(rs) = rows.station_mut(*id) {
                    rs.station.status = *status;
                    rs.station.occupant = *occupant;
                    rs.station.updated_at = *at;
                } else {
                    missing_row("station", *id, change);
                }
            }
            Change::PersonRegistered { id, external_id, contact, name, quota, at } => {
                self.external_ids.insert(normalize_key(external_id), *id);
                self.contacts.insert(normalize_key(contact), *id);
                let person = Person {
                    id: *id,
                    external_id: external_id.clone(),
                    contact: contact.clone(),
                    name: name.clone(),
                    active: true,
                    remaining: *quota,
                    granted: *quota,
                    registered_at: *at,
                };
                self.people.insert(
                    *id,
                    Arc::new(RwLock::new(PersonState { person, removed: false })),
                );
            }
            Change::PersonRemoved { id } => {
                if let Some(ps) = rows.person_mut(*id) {
                    ps.removed = true;
                    let (external_id, contact) =
                        (ps.person.external_id.clone(), ps.person.contact.clone());
                    self.release_person_keys(&external_id, &contact, *id);
                } else {
                    missing_row("person", *id, change);
                }
                self.people.remove(id);
            }
            Change::PersonActiveSet { id, active } => match rows.person_mut(*id) {
                Some(ps) => ps.person.active = *active,
                None => missing_row("person", *id, change),
            },
            Change::QuotaSet { id, remaining } => match rows.person_mut(*id) {
                Some(ps) => {
                    ps.person.remaining = *remaining;
                    ps.person.granted = *remaining;
                }
                None => missing_row("person", *id, change),
            },
            Change::QuotaDecremented { id, remaining } => match rows.person_mut(*id) {
                Some(ps) => ps.person.remaining = Some(*remaining),
                None => missing_row("person", *id, change),
            },
            Change::BookingInserted { booking } => match rows.station_mut(booking.station_id) {
                Some(rs) => {
                    let pos = rs
                        .bookings
                        .partition_point(|b| b.span.start <= booking.span.start);
                    rs.bookings.insert(pos, booking.clone());
                    self.booking_index.insert(booking.id, booking.station_id);
                }
                None => missing_row("station", booking.station_id, change),
            },
            Change::BookingStatusSet { id, station_id, status, .. } => {
                match rows
                    .station_mut(*station_id)
                    .and_then(|rs| rs.bookings.iter_mut().find(|b| b.id == *id))
                {
                    Some(b) => b.status = *status,
                    None => missing_row("booking", *id, change),
                }
            }
            Change::BookingArchived { booking } => {
                self.archive.insert(booking.id, booking.clone());
            }
        }
    }

    /// Rebuild from a replayed log. Rows are fresh and unshared, so every
    /// `try_write_owned` succeeds immediately. Returns the highest seq seen.
    pub fn replay(&self, commits: &[Commit]) -> u64 {
        let mut last_seq = 0;
        for commit in commits {
            last_seq = last_seq.max(commit.seq);
            for change in &commit.changes {
                let mut rows = Locked::default();
                let (station_id, person_id) = change_rows(change);
                if let Some(sid) = station_id
                    && let Some(row) = self.get_station(&sid)
                    && let Ok(guard) = row.try_write_owned()
                {
                    rows.push_station(guard);
                }
                if let Some(pid) = person_id
                    && let Some(row) = self.get_person(&pid)
                    && let Ok(guard) = row.try_write_owned()
                {
                    rows.push_person(guard);
                }
                self.apply(&mut rows, change);
            }
        }
        last_seq
    }

    /// The smallest log that rebuilds the current ledger, one commit per row.
    /// Only called on a private, unshared store.
    pub fn image(&self, seq: u64) -> Vec<Commit> {
        let mut commits = Vec::new();
        for sid in self.station_ids() {
            let Some(row) = self.get_station(&sid) else { continue };
            let Ok(rs) = row.try_read() else {
                warn!("compaction: station {sid} locked, skipped");
                continue;
            };
            let mut changes = vec![Change::StationCreated {
                id: sid,
                name: rs.station.name.clone(),
                at: rs.station.updated_at,
            }];
            changes.extend(
                rs.bookings
                    .iter()
                    .map(|b| Change::BookingInserted { booking: b.clone() }),
            );
            if rs.station.status != StationStatus::Free || rs.station.occupant.is_some() {
                changes.push(Change::StationUpdated {
                    id: sid,
                    status: rs.station.status,
                    occupant: rs.station.occupant,
                    at: rs.station.updated_at,
                });
            }
            commits.push(Commit { seq, at: rs.station.updated_at, changes });
        }
        for pid in self.person_ids() {
            let Some(row) = self.get_person(&pid) else { continue };
            let Ok(ps) = row.try_read() else {
                warn!("compaction: person {pid} locked, skipped");
                continue;
            };
            let p = &ps.person;
            let mut changes = vec![Change::PersonRegistered {
                id: pid,
                external_id: p.external_id.clone(),
                contact: p.contact.clone(),
                name: p.name.clone(),
                quota: p.granted,
                at: p.registered_at,
            }];
            if p.remaining != p.granted
                && let Some(remaining) = p.remaining
            {
                changes.push(Change::QuotaDecremented { id: pid, remaining });
            }
            if !p.active {
                changes.push(Change::PersonActiveSet { id: pid, active: false });
            }
            commits.push(Commit { seq, at: p.registered_at, changes });
        }
        let archived: Vec<Change> = self
            .archived_bookings()
            .into_iter()
            .map(|booking| Change::BookingArchived { booking })
            .collect();
        if !archived.is_empty() {
            commits.push(Commit { seq, at: 0, changes: archived });
        }
        commits
    }
}

fn reserve(index: &DashMap<String, Ulid>, key: &str, id: Ulid, what: &'static str) -> Result<(), EngineError> {
    match index.entry(normalize_key(key)) {
        dashmap::mapref::entry::Entry::Occupied(_) => {
            Err(EngineError::AlreadyExists(what, key.trim().to_string()))
        }
        dashmap::mapref::entry::Entry::Vacant(slot) => {
            slot.insert(id);
            Ok(())
        }
    }
}

fn missing_row(kind: &str, id: Ulid, change: &Change) {
    error!("{kind} {id} not locked or gone while applying {change:?}");
}

/// Rows an existing-row change touches. Creations return none.
fn change_rows(change: &Change) -> (Option<Ulid>, Option<Ulid>) {
    match change {
        Change::StationDeleted { id } | Change::StationUpdated { id, .. } => (Some(*id), None),
        Change::PersonRemoved { id }
        | Change::PersonActiveSet { id, .. }
        | Change::QuotaSet { id, .. }
        | Change::QuotaDecremented { id, .. } => (None, Some(*id)),
        Change::BookingInserted { booking } => (Some(booking.station_id), None),
        Change::BookingStatusSet { station_id, .. } => (Some(*station_id), None),
        Change::StationCreated { .. }
        | Change::PersonRegistered { .. }
        | Change::BookingArchived { .. } => (None, None),
    }
}

// ── Locked rows ──────────────────────────────────────────────

/// Write guards held by one operation, taken stations first then people,
/// each in ascending id order.
#[derive(Default)]
pub struct Locked {
    stations: Vec<OwnedRwLockWriteGuard<StationState>>,
    people: Vec<OwnedRwLockWriteGuard<PersonState>>,
}

impl Locked {
    pub fn push_station(&mut self, guard: OwnedRwLockWriteGuard<StationState>) {
        self.stations.push(guard);
    }

    pub fn push_person(&mut self, guard: OwnedRwLockWriteGuard<PersonState>) {
        self.people.push(guard);
    }

    /// Release the most recently taken person lock.
    pub fn pop_person(&mut self) {
        self.people.pop();
    }

    pub fn station(&self, id: Ulid) -> Option<&StationState> {
        self.stations.iter().find(|g| g.id() == id).map(|g| &**g)
    }

    pub fn station_mut(&mut self, id: Ulid) -> Option<&mut StationState> {
        self.stations
            .iter_mut()
            .find(|g| g.id() == id)
            .map(|g| &mut **g)
    }

    pub fn person(&self, id: Ulid) -> Option<&PersonState> {
        self.people
            .iter()
            .find(|g| g.person.id == id)
            .map(|g| &**g)
    }

    pub fn person_mut(&mut self, id: Ulid) -> Option<&mut PersonState> {
        self.people
            .iter_mut()
            .find(|g| g.person.id == id)
            .map(|g| &mut **g)
    }

    pub fn get_station(&self, id: Ulid) -> Option<&Station> {
        self.station(id).map(|rs| &rs.station)
    }

    pub fn list_active_bookings_for_station(&self, id: Ulid) -> Vec<Booking> {
        self.station(id)
            .map(|rs| rs.live_bookings().cloned().collect())
            .unwrap_or_default()
    }

    /// `None` if the person is not locked; `Some(None)` means unlimited.
    pub fn get_person_quota(&self, id: Ulid) -> Option<Option<u32>> {
        self.person(id).map(|ps| ps.person.remaining)
    }
}

// ── Staged writes ────────────────────────────────────────────

/// Changes staged by one logical operation, committed together.
pub struct Txn {
    pub at: Ms,
    pub changes: Vec<Change>,
}

impl Txn {
    pub fn new(at: Ms) -> Self {
        Self { at, changes: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        self.changes.push(Change::BookingInserted { booking });
    }

    pub fn update_booking_status(
        &mut self,
        booking: &Booking,
        status: BookingStatus,
    ) -> Result<(), EngineError> {
        if !booking.status.can_become(status) {
            return Err(EngineError::InvalidTransition {
                id: booking.id,
                from: booking.status.as_str(),
                to: status.as_str(),
            });
        }
        self.changes.push(Change::BookingStatusSet {
            id: booking.id,
            station_id: booking.station_id,
            person_id: booking.person_id,
            status,
        });
        Ok(())
    }

    pub fn update_station(&mut self, id: Ulid, status: StationStatus, occupant: Option<Ulid>) {
        self.changes.push(Change::StationUpdated {
            id,
            status,
            occupant,
            at: self.at,
        });
    }

    pub fn set_person_quota(&mut self, id: Ulid, remaining: Option<u32>) {
        self.changes.push(Change::QuotaSet { id, remaining });
    }

    pub fn set_active(&mut self, id: Ulid, active: bool) {
        self.changes.push(Change::PersonActiveSet { id, active });
    }

    /// Stage one unit of usage. Unlimited quotas are never decremented.
    pub fn compare_and_decrement_quota(&mut self, person: &Person) -> Result<Option<u32>, EngineError> {
        match person.remaining {
            None => Ok(None),
            Some(0) => Err(EngineError::QuotaExhausted(person.id)),
            Some(n) => {
                self.changes.push(Change::QuotaDecremented {
                    id: person.id,
                    remaining: n - 1,
                });
                Ok(Some(n - 1))
            }
        }
    }
}
