use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::auth::{Caller, IdentityProvider, Role};
use crate::engine::calendar::local_date;
use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::MAX_LINE_LEN;
use crate::model::{Actor, Ms, Span};
use crate::observability;

/// One line from the client, tagged by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        identity: String,
        role: Role,
        #[serde(default)]
        password: String,
    },
    CreateBooking {
        station_id: Ulid,
        /// Required for admins; members always book for themselves.
        person_id: Option<Ulid>,
        start: Ms,
        end: Ms,
    },
    CancelBooking {
        booking_id: Ulid,
    },
    Assign {
        station_id: Ulid,
        person_id: Ulid,
    },
    Unassign {
        station_id: Ulid,
    },
    Withdraw {
        station_id: Ulid,
    },
    Restore {
        station_id: Ulid,
    },
    GrantUsage {
        person_id: Ulid,
        days: u32,
    },
    ToggleActive {
        person_id: Ulid,
    },
    CreateStation {
        name: String,
    },
    DeleteStation {
        station_id: Ulid,
    },
    RegisterPerson {
        external_id: String,
        contact: String,
        name: String,
        quota: Option<u32>,
    },
    RemovePerson {
        person_id: Ulid,
    },
    GetStation {
        station_id: Ulid,
    },
    ListStations,
    GetPerson {
        person_id: Ulid,
    },
    ListPeople,
    GetBooking {
        booking_id: Ulid,
    },
    ListBookings {
        station_id: Option<Ulid>,
        person_id: Option<Ulid>,
    },
    LabStatus,
    /// The Monday-to-Friday grid for the current week.
    WeekSchedule,
    ToggleDay {
        person_id: Ulid,
        date: NaiveDate,
        station_id: Option<Ulid>,
    },
    /// Bookings starting on `date`, tomorrow when omitted.
    DayBookings {
        date: Option<NaiveDate>,
        person_id: Option<Ulid>,
    },
    Subscribe,
}

impl Request {
    fn admin_only(&self) -> bool {
        matches!(
            self,
            Request::Assign { .. }
                | Request::Unassign { .. }
                | Request::Withdraw { .. }
                | Request::Restore { .. }
                | Request::GrantUsage { .. }
                | Request::ToggleActive { .. }
                | Request::CreateStation { .. }
                | Request::DeleteStation { .. }
                | Request::RegisterPerson { .. }
                | Request::RemovePerson { .. }
                | Request::ListPeople
                | Request::WeekSchedule
                | Request::ToggleDay { .. }
        )
    }
}

#[derive(Debug)]
pub enum WireError {
    Codec(LinesCodecError),
    Closed,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Codec(e) => write!(f, "codec error: {e}"),
            WireError::Closed => write!(f, "peer closed before hello"),
        }
    }
}

impl std::error::Error for WireError {}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        WireError::Codec(e)
    }
}

/// Why a request produced an error line.
enum Failure {
    Engine(EngineError),
    BadRequest(String),
    Unauthorized(String),
}

impl From<EngineError> for Failure {
    fn from(e: EngineError) -> Self {
        Failure::Engine(e)
    }
}

impl Failure {
    fn code(&self) -> &'static str {
        match self {
            Failure::Engine(e) => e.code(),
            Failure::BadRequest(_) => "bad_request",
            Failure::Unauthorized(_) => "unauthorized",
        }
    }

    fn to_json(&self) -> Value {
        let mut error = json!({
            "code": self.code(),
            "retryable": matches!(self, Failure::Engine(e) if e.is_retryable()),
        });
        error["message"] = match self {
            Failure::Engine(e) => Value::String(e.to_string()),
            Failure::BadRequest(msg) | Failure::Unauthorized(msg) => Value::String(msg.clone()),
        };
        if let Failure::Engine(EngineError::Conflict { booking_id, span }) = self {
            error["conflict"] = json!({
                "booking_id": booking_id,
                "start": span.start,
                "end": span.end,
            });
        }
        json!({ "ok": false, "error": error })
    }
}

fn ok(result: Value) -> Value {
    json!({ "ok": true, "result": result })
}

fn to_value(v: impl serde::Serialize) -> Result<Value, Failure> {
    serde_json::to_value(v).map_err(|e| Failure::BadRequest(format!("unencodable result: {e}")))
}

/// Authenticated connection state.
struct Session {
    caller: Caller,
    /// The member's own person id. `None` for admins.
    person_id: Option<Ulid>,
}

impl Session {
    fn actor(&self) -> Actor {
        match self.person_id {
            Some(pid) if !self.caller.is_admin() => Actor::Person(pid),
            _ => Actor::Admin,
        }
    }
}

type Lines = Framed<TcpStream, LinesCodec>;

/// Serve one client: hello, then request/response lines until EOF or subscribe.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    identities: Arc<dyn IdentityProvider>,
) -> Result<(), WireError> {
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    let Some(session) = handshake(&mut lines, &engine, identities.as_ref()).await? else {
        return Ok(());
    };
    info!(identity = %session.caller.identity, role = ?session.caller.role, "session started");

    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                let failure = Failure::BadRequest("line too long".into());
                lines.send(failure.to_json().to_string()).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let failure = Failure::BadRequest(format!("malformed request: {e}"));
                lines.send(failure.to_json().to_string()).await?;
                continue;
            }
        };
        if let Request::Subscribe = request {
            return stream_events(lines, &engine).await;
        }

        let op = observability::op_label(&request);
        let start = Instant::now();
        let reply = match handle(&engine, &session, request).await {
            Ok(result) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
                ok(result)
            }
            Err(failure) => {
                debug!(op, code = failure.code(), "request rejected");
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "error").increment(1);
                metrics::counter!(observability::REJECTIONS_TOTAL, "code" => failure.code()).increment(1);
                failure.to_json()
            }
        };
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        lines.send(reply.to_string()).await?;
    }
    debug!(identity = %session.caller.identity, "session closed");
    Ok(())
}

/// Expect a hello line. `Ok(None)` means the client was refused and told why.
async fn handshake(
    lines: &mut Lines,
    engine: &Engine,
    identities: &dyn IdentityProvider,
) -> Result<Option<Session>, WireError> {
    let first = match lines.next().await {
        Some(line) => line?,
        None => return Err(WireError::Closed),
    };
    let Ok(Request::Hello { identity, role, password }) = serde_json::from_str::<Request>(&first) else {
        let failure = Failure::BadRequest("first line must be hello".into());
        lines.send(failure.to_json().to_string()).await?;
        return Ok(None);
    };

    let caller = match identities.authenticate(&identity, role, &password).await {
        Ok(caller) => caller,
        Err(e) => {
            warn!(identity, "authentication failed: {e}");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            lines.send(Failure::Unauthorized(e.to_string()).to_json().to_string()).await?;
            return Ok(None);
        }
    };

    let person_id = match caller.role {
        Role::Admin => None,
        Role::Member => match engine.find_person_by_external_id(&caller.identity).await {
            Ok(Some(person)) => Some(person.id),
            Ok(None) => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                let failure = Failure::Unauthorized(format!("no registered person {}", caller.identity));
                lines.send(failure.to_json().to_string()).await?;
                return Ok(None);
            }
            Err(e) => {
                lines.send(Failure::Engine(e).to_json().to_string()).await?;
                return Ok(None);
            }
        },
    };

    let hello = json!({ "identity": caller.identity, "role": caller.role, "person_id": person_id });
    lines.send(ok(hello).to_string()).await?;
    Ok(Some(Session { caller, person_id }))
}

async fn handle(engine: &Engine, session: &Session, request: Request) -> Result<Value, Failure> {
    if request.admin_only() && !session.caller.is_admin() {
        return Err(EngineError::Forbidden("admin only").into());
    }
    let own = session.person_id;
    match request {
        Request::Hello { .. } => Err(Failure::BadRequest("already authenticated".into())),
        Request::Subscribe => Err(Failure::BadRequest("subscribe is handled by the session".into())),

        Request::CreateBooking { station_id, person_id, start, end } => {
            let person_id = match (own, person_id) {
                (Some(me), Some(asked)) if me != asked => {
                    return Err(EngineError::Forbidden("members book for themselves").into());
                }
                (Some(me), _) => me,
                (None, Some(pid)) => pid,
                (None, None) => return Err(Failure::BadRequest("person_id is required".into())),
            };
            to_value(engine.create_booking(station_id, person_id, Span { start, end }).await?)
        }
        Request::CancelBooking { booking_id } => {
            to_value(engine.cancel_booking(booking_id, session.actor()).await?)
        }

        Request::Assign { station_id, person_id } => to_value(engine.assign(station_id, person_id).await?),
        Request::Unassign { station_id } => to_value(engine.unassign(station_id).await?),
        Request::Withdraw { station_id } => to_value(engine.withdraw(station_id).await?),
        Request::Restore { station_id } => to_value(engine.restore(station_id).await?),
        Request::GrantUsage { person_id, days } => to_value(engine.grant_usage(person_id, days).await?),
        Request::ToggleActive { person_id } => to_value(engine.toggle_active(person_id).await?),
        Request::CreateStation { name } => to_value(engine.create_station(&name).await?),
        Request::DeleteStation { station_id } => {
            engine.delete_station(station_id).await?;
            Ok(json!({ "deleted": station_id }))
        }
        Request::RegisterPerson { external_id, contact, name, quota } => {
            to_value(engine.register_person(&external_id, &contact, &name, quota).await?)
        }
        Request::RemovePerson { person_id } => {
            engine.remove_person(person_id).await?;
            Ok(json!({ "removed": person_id }))
        }

        Request::GetStation { station_id } => to_value(engine.get_station(station_id).await?),
        Request::ListStations => to_value(engine.list_stations().await?),
        Request::GetPerson { person_id } => {
            if own.is_some_and(|me| me != person_id) {
                return Err(EngineError::Forbidden("members may only read themselves").into());
            }
            to_value(engine.get_person(person_id).await?)
        }
        Request::ListPeople => to_value(engine.list_people().await?),
        Request::GetBooking { booking_id } => to_value(engine.get_booking(booking_id).await?),
        Request::ListBookings { station_id, person_id } => {
            to_value(engine.list_bookings(station_id, person_id).await?)
        }
        Request::LabStatus => to_value(engine.lab_status(now_ms()).await?),
        Request::WeekSchedule => to_value(engine.week_schedule(now_ms()).await?),
        Request::ToggleDay { person_id, date, station_id } => {
            to_value(engine.toggle_day(person_id, date, station_id).await?)
        }
        Request::DayBookings { date, person_id } => {
            let person_id = match (own, person_id) {
                (Some(me), Some(asked)) if me != asked => {
                    return Err(EngineError::Forbidden("members may only read themselves").into());
                }
                (Some(me), _) => Some(me),
                (None, asked) => asked,
            };
            let date = match date {
                Some(d) => d,
                None => local_date(now_ms(), engine.config().utc_offset)
                    .and_then(|today| today.succ_opt())
                    .ok_or(EngineError::InvalidArgument("date out of range"))?,
            };
            to_value(engine.bookings_on_day(date, person_id).await?)
        }
    }
}

/// Subscribe first, then snapshot, so no change can fall between the two.
/// Events after that flow until the peer leaves or the observer is dropped.
async fn stream_events(mut lines: Lines, engine: &Engine) -> Result<(), WireError> {
    let mut events = engine.notify.subscribe();
    let snapshot = match engine.list_stations().await {
        Ok(stations) => ok(json!({ "stations": stations })),
        Err(e) => {
            lines.send(Failure::Engine(e).to_json().to_string()).await?;
            return Ok(());
        }
    };
    lines.send(snapshot.to_string()).await?;
    debug!(observer = events.id(), "observer attached");

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => lines.send(json!({ "event": event }).to_string()).await?,
                None => {
                    debug!(observer = events.id(), "observer stream ended");
                    break;
                }
            },
            incoming = lines.next() => match incoming {
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }
    Ok(())
}
