use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_text};
use super::store::{Locked, Txn};
use super::{Engine, EngineError, Entity};

/// Attempts at collecting a consistent lock set for `remove_person`.
const REMOVE_ATTEMPTS: usize = 3;

impl Engine {
    pub async fn register_person(
        &self,
        external_id: &str,
        contact: &str,
        name: &str,
        quota: Option<u32>,
    ) -> Result<Person, EngineError> {
        validate_text(external_id, MAX_EXTERNAL_ID_LEN, "external id")?;
        validate_text(contact, MAX_CONTACT_LEN, "contact")?;
        validate_text(name, MAX_NAME_LEN, "person name")?;
        if self.store.person_count() >= MAX_PEOPLE {
            return Err(EngineError::LimitExceeded("too many people"));
        }
        let id = Ulid::new();
        let (external_id, contact, name) = (external_id.trim(), contact.trim(), name.trim());
        self.store.reserve_person_keys(external_id, contact, id)?;

        let at = now_ms();
        let mut txn = Txn::new(at);
        txn.push(Change::PersonRegistered {
            id,
            external_id: external_id.to_string(),
            contact: contact.to_string(),
            name: name.to_string(),
            quota,
            at,
        });
        let outbox = match self.commit(&mut Locked::default(), txn).await {
            Ok(outbox) => outbox,
            Err(e) => {
                self.store.release_person_keys(external_id, contact, id);
                return Err(e);
            }
        };
        self.publish(outbox);
        info!(person = %id, external_id, "person registered");
        Ok(Person {
            id,
            external_id: external_id.to_string(),
            contact: contact.to_string(),
            name: name.to_string(),
            active: true,
            remaining: quota,
            granted: quota,
            registered_at: at,
        })
    }

    /// Overwrite the person's usage quota. `days` becomes both the remaining
    /// and the granted amount.
    pub async fn grant_usage(&self, person_id: Ulid, days: u32) -> Result<Person, EngineError> {
        let person = self.lock_person(person_id).await?;
        let mut txn = Txn::new(now_ms());
        txn.set_person_quota(person_id, Some(days));
        self.commit_person(person, txn).await
    }

    pub async fn toggle_active(&self, person_id: Ulid) -> Result<Person, EngineError> {
        let person = self.lock_person(person_id).await?;
        let mut txn = Txn::new(now_ms());
        txn.set_active(person_id, !person.person.active);
        self.commit_person(person, txn).await
    }

    /// Consume one unit of quota on its own. Returns the remaining units,
    /// `None` for unlimited.
    pub async fn decrement_if_available(&self, person_id: Ulid) -> Result<Option<u32>, EngineError> {
        let person = self.lock_person(person_id).await?;
        let mut txn = Txn::new(now_ms());
        let remaining = txn.compare_and_decrement_quota(&person.person)?;
        self.commit_person(person, txn).await?;
        Ok(remaining)
    }

    async fn commit_person(
        &self,
        guard: tokio::sync::OwnedRwLockWriteGuard<PersonState>,
        txn: Txn,
    ) -> Result<Person, EngineError> {
        let person_id = guard.person.id;
        let mut rows = Locked::default();
        rows.push_person(guard);
        let outbox = self.commit(&mut rows, txn).await?;
        let snapshot = rows.person(person_id).map(|ps| ps.person.clone());
        drop(rows);
        self.publish(outbox);
        snapshot.ok_or(EngineError::NotFound(Entity::Person, person_id))
    }

    /// Remove a person. Their live bookings are cancelled and any station
    /// they occupy is freed, all in one commit.
    pub async fn remove_person(&self, person_id: Ulid) -> Result<(), EngineError> {
        for attempt in 1..=REMOVE_ATTEMPTS {
            let involved = self.stations_involving(person_id).await?;

            let mut rows = Locked::default();
            for sid in &involved {
                match self.lock_station(*sid).await {
                    Ok(guard) => rows.push_station(guard),
                    // deleted since the scan; its bookings are already cancelled
                    Err(EngineError::NotFound(..)) => {}
                    Err(e) => return Err(e),
                }
            }
            let person = self.lock_person(person_id).await?;

            // A booking made between the scan and the person lock lands on a
            // station outside our set. Only unlocked stations need rechecking.
            if self.involved_elsewhere(person_id, &involved) {
                warn!(person = %person_id, attempt, "person gained a booking during removal, retrying");
                continue;
            }

            let mut txn = Txn::new(now_ms());
            for sid in &involved {
                let Some(rs) = rows.station(*sid) else { continue };
                for b in rs.live_bookings().filter(|b| b.person_id == person_id) {
                    txn.update_booking_status(b, BookingStatus::Cancelled)?;
                }
                if rs.station.occupant == Some(person_id) {
                    txn.update_station(*sid, StationStatus::Free, None);
                }
            }
            txn.push(Change::PersonRemoved { id: person_id });

            rows.push_person(person);
            let outbox = self.commit(&mut rows, txn).await?;
            drop(rows);
            self.publish(outbox);
            info!(person = %person_id, "person removed");
            return Ok(());
        }
        Err(EngineError::Busy(Entity::Person, person_id))
    }

    /// Stations where the person sits or holds a live booking, ascending.
    async fn stations_involving(&self, person_id: Ulid) -> Result<Vec<Ulid>, EngineError> {
        let mut involved = Vec::new();
        for sid in self.store.station_ids() {
            let rs = match self.read_station(sid).await {
                Ok(rs) => rs,
                Err(EngineError::NotFound(..)) => continue,
                Err(e) => return Err(e),
            };
            if involves(&rs, person_id) {
                involved.push(sid);
            }
        }
        Ok(involved)
    }

    /// Non-blocking recheck of stations outside `locked`. A station we can't
    /// peek at counts as involved, forcing a retry.
    fn involved_elsewhere(&self, person_id: Ulid, locked: &[Ulid]) -> bool {
        self.store
            .station_ids()
            .into_iter()
            .filter(|sid| !locked.contains(sid))
            .filter_map(|sid| self.store.get_station(&sid))
            .any(|row| match row.try_read() {
                Ok(rs) => !rs.deleted && involves(&rs, person_id),
                Err(_) => true,
            })
    }
}

fn involves(rs: &StationState, person_id: Ulid) -> bool {
    rs.station.occupant == Some(person_id)
        || rs.live_bookings().any(|b| b.person_id == person_id)
}
