use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{now_ms, validate_text};
use super::store::{Locked, Txn};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_station(&self, name: &str) -> Result<Station, EngineError> {
        validate_text(name, MAX_NAME_LEN, "station name")?;
        if self.store.station_count() >= MAX_STATIONS {
            return Err(EngineError::LimitExceeded("too many stations"));
        }
        let id = Ulid::new();
        let name = name.trim().to_string();
        self.store.reserve_station_name(&name, id)?;

        let at = now_ms();
        let mut txn = Txn::new(at);
        txn.push(Change::StationCreated {
            id,
            name: name.clone(),
            at,
        });
        let outbox = match self.commit(&mut Locked::default(), txn).await {
            Ok(outbox) => outbox,
            Err(e) => {
                self.store.release_station_name(&name, id);
                return Err(e);
            }
        };
        self.publish(outbox);
        info!(station = %id, %name, "station created");
        Ok(StationState::new(id, name, at).station)
    }

    /// Remove a station. Its scheduled and active bookings are cancelled in the
    /// same commit; all of its history stays queryable.
    pub async fn delete_station(&self, station_id: Ulid) -> Result<(), EngineError> {
        let guard = self.lock_station(station_id).await?;
        let mut txn = Txn::new(now_ms());
        for b in guard.live_bookings() {
            txn.update_booking_status(b, BookingStatus::Cancelled)?;
        }
        txn.push(Change::StationDeleted { id: station_id });

        let mut rows = Locked::default();
        rows.push_station(guard);
        let outbox = self.commit(&mut rows, txn).await?;
        drop(rows);
        self.publish(outbox);
        info!(station = %station_id, "station deleted");
        Ok(())
    }

    /// Seat a person at a free station now, charging one unit of quota.
    pub async fn assign(&self, station_id: Ulid, person_id: Ulid) -> Result<Station, EngineError> {
        let station = self.lock_station(station_id).await?;
        match station.station.status {
            StationStatus::Free => {}
            StationStatus::Withdrawn => return Err(EngineError::StationWithdrawn(station_id)),
            StationStatus::Occupied => {
                return Err(EngineError::InvalidTransition {
                    id: station_id,
                    from: "occupied",
                    to: "occupied",
                });
            }
        }
        let person = self.lock_person(person_id).await?;
        if !person.person.active {
            return Err(EngineError::InactivePerson(person_id));
        }

        let mut txn = Txn::new(now_ms());
        txn.compare_and_decrement_quota(&person.person)?;
        txn.update_station(station_id, StationStatus::Occupied, Some(person_id));

        let mut rows = Locked::default();
        rows.push_station(station);
        rows.push_person(person);
        let outbox = self.commit(&mut rows, txn).await?;
        let snapshot = rows.get_station(station_id).cloned();
        drop(rows);
        self.publish(outbox);
        snapshot.ok_or(EngineError::NotFound(super::Entity::Station, station_id))
    }

    pub async fn unassign(&self, station_id: Ulid) -> Result<Station, EngineError> {
        let station = self.lock_station(station_id).await?;
        if station.station.status != StationStatus::Occupied {
            return Err(EngineError::InvalidTransition {
                id: station_id,
                from: station.station.status.as_str(),
                to: "free",
            });
        }
        self.set_station_status(station, StationStatus::Free).await
    }

    /// Take a station out of service from any state. Clears the occupant.
    /// Withdrawing an already withdrawn station changes nothing.
    pub async fn withdraw(&self, station_id: Ulid) -> Result<Station, EngineError> {
        let station = self.lock_station(station_id).await?;
        if station.station.status == StationStatus::Withdrawn {
            return Ok(station.station.clone());
        }
        self.set_station_status(station, StationStatus::Withdrawn).await
    }

    pub async fn restore(&self, station_id: Ulid) -> Result<Station, EngineError> {
        let station = self.lock_station(station_id).await?;
        if station.station.status != StationStatus::Withdrawn || station.station.occupant.is_some() {
            return Err(EngineError::InvalidTransition {
                id: station_id,
                from: station.station.status.as_str(),
                to: "free",
            });
        }
        self.set_station_status(station, StationStatus::Free).await
    }

    /// Commit a move to an unoccupied status on an already locked station.
    async fn set_station_status(
        &self,
        guard: tokio::sync::OwnedRwLockWriteGuard<StationState>,
        status: StationStatus,
    ) -> Result<Station, EngineError> {
        let station_id = guard.id();
        let mut txn = Txn::new(now_ms());
        txn.update_station(station_id, status, None);

        let mut rows = Locked::default();
        rows.push_station(guard);
        let outbox = self.commit(&mut rows, txn).await?;
        let snapshot = rows.get_station(station_id).cloned();
        drop(rows);
        self.publish(outbox);
        snapshot.ok_or(EngineError::NotFound(super::Entity::Station, station_id))
    }
}
