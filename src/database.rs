extern crate postgres;
extern crate postgres_openssl;

use crate::accumulator::Calculations;
use crate::config::PostgresSettings;
use crate::diagnosis::Alert;
use chrono::{Datelike, NaiveDateTime, Timelike};
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use postgres_openssl::MakeTlsConnector;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

const CREATE_TABLES: &str = "
create table if not exists measurements (
    id bigserial primary key,
    ts timestamp not null,
    device_id text not null,
    field text not null,
    value double precision not null
);
create table if not exists calculations (
    id bigserial primary key,
    ts timestamp not null,
    total_pv_power double precision not null,
    consumption_power double precision not null,
    battery_power double precision not null,
    battery_soc double precision,
    battery_voltage double precision,
    daily_energy double precision not null,
    monthly_energy double precision not null,
    total_energy double precision not null,
    points jsonb
);
create table if not exists alerts (
    id bigserial primary key,
    ts timestamp not null,
    severity text not null,
    category text not null,
    title text not null,
    message text not null,
    component text not null,
    value double precision not null,
    threshold double precision not null,
    acknowledged boolean not null default false,
    acknowledged_at timestamp,
    resolved boolean not null default false,
    resolved_at timestamp,
    deleted boolean not null default false
);
create index if not exists calculations_ts_idx on calculations (ts);
";
const INSERT_MEASUREMENT: &str =
    "insert into measurements (ts, device_id, field, value) values ($1, $2, $3, $4)";
const INSERT_CALCULATION: &str = "insert into calculations (ts, total_pv_power, consumption_power, battery_power, battery_soc, battery_voltage, daily_energy, monthly_energy, total_energy, points) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("alert {0} does not exist")]
    UnknownAlert(i64),
    #[error("no active database connection")]
    NotConnected,
}

/// User or cycle driven lifecycle transition of a stored alert
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AlertUpdate {
    Acknowledged(NaiveDateTime),
    Resolved(NaiveDateTime),
    /// soft delete, also marks the alert resolved
    Deleted(NaiveDateTime),
}

impl AlertUpdate {
    fn apply(&self, alert: &mut Alert) {
        match *self {
            AlertUpdate::Acknowledged(at) => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(at);
            }
            AlertUpdate::Resolved(at) => {
                alert.resolved = true;
                alert.resolved_at = Some(at);
            }
            AlertUpdate::Deleted(at) => {
                alert.deleted = true;
                alert.resolved = true;
                alert.resolved_at = Some(at);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    /// unknown names fall back to `Hour`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "day" => Granularity::Day,
            "month" => Granularity::Month,
            _ => Granularity::Hour,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
        }
    }

    /// Start of the bucket containing `ts`, same as postgres `date_trunc`
    pub fn truncate(&self, ts: NaiveDateTime) -> NaiveDateTime {
        let (date, hour) = match self {
            Granularity::Hour => (ts.date(), ts.hour()),
            Granularity::Day => (ts.date(), 0),
            Granularity::Month => (ts.date().with_day(1).unwrap_or_else(|| ts.date()), 0),
        };
        date.and_hms_opt(hour, 0, 0).unwrap_or(ts)
    }
}

/// Averages of stored calculations over one time bucket
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: NaiveDateTime,
    pub total_pv_power: f64,
    pub consumption_power: f64,
    pub battery_power: f64,
    pub battery_soc: Option<f64>,
    /// highest counter value seen in the bucket
    pub daily_energy: f64,
    pub samples: i64,
}

/// One numeric field of one device
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub device_id: String,
    pub field: String,
    pub value: f64,
}

pub trait Store: Send {
    fn insert_measurement(
        &mut self,
        timestamp: NaiveDateTime,
        device_id: &str,
        field: &str,
        value: f64,
    ) -> std::result::Result<(), StoreError>;

    fn insert_calculation(
        &mut self,
        timestamp: NaiveDateTime,
        calculations: &Calculations,
    ) -> std::result::Result<(), StoreError>;

    /// Everything one cycle produced: either all of it is stored or nothing
    fn insert_cycle(
        &mut self,
        timestamp: NaiveDateTime,
        measurements: &[Measurement],
        calculations: &Calculations,
    ) -> std::result::Result<(), StoreError>;

    /// Persists a new alert and returns its assigned id
    fn insert_alert(&mut self, alert: &Alert) -> std::result::Result<i64, StoreError>;

    fn update_alert(&mut self, id: i64, update: AlertUpdate) -> std::result::Result<(), StoreError>;

    /// Newest first
    fn list_alerts(
        &mut self,
        limit: usize,
        active_only: bool,
    ) -> std::result::Result<Vec<Alert>, StoreError>;

    fn history(
        &mut self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        granularity: Granularity,
    ) -> std::result::Result<Vec<HistoryPoint>, StoreError>;
}

/// Store kept in process memory, used when no database is configured
#[derive(Default)]
pub struct MemoryStore {
    measurements: Vec<(NaiveDateTime, String, String, f64)>,
    calculations: Vec<(NaiveDateTime, Calculations)>,
    alerts: Vec<Alert>,
    next_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Store for MemoryStore {
    fn insert_measurement(
        &mut self,
        timestamp: NaiveDateTime,
        device_id: &str,
        field: &str,
        value: f64,
    ) -> std::result::Result<(), StoreError> {
        self.measurements
            .push((timestamp, device_id.to_string(), field.to_string(), value));
        Ok(())
    }

    fn insert_calculation(
        &mut self,
        timestamp: NaiveDateTime,
        calculations: &Calculations,
    ) -> std::result::Result<(), StoreError> {
        self.calculations.push((timestamp, calculations.clone()));
        Ok(())
    }

    fn insert_cycle(
        &mut self,
        timestamp: NaiveDateTime,
        measurements: &[Measurement],
        calculations: &Calculations,
    ) -> std::result::Result<(), StoreError> {
        for m in measurements {
            self.insert_measurement(timestamp, &m.device_id, &m.field, m.value)?;
        }
        self.insert_calculation(timestamp, calculations)
    }

    fn insert_alert(&mut self, alert: &Alert) -> std::result::Result<i64, StoreError> {
        self.next_id += 1;
        let mut stored = alert.clone();
        stored.id = Some(self.next_id);
        self.alerts.push(stored);
        Ok(self.next_id)
    }

    fn update_alert(&mut self, id: i64, update: AlertUpdate) -> std::result::Result<(), StoreError> {
        match self.alerts.iter_mut().find(|a| a.id == Some(id)) {
            Some(alert) => {
                update.apply(alert);
                Ok(())
            }
            None => Err(StoreError::UnknownAlert(id)),
        }
    }

    fn list_alerts(
        &mut self,
        limit: usize,
        active_only: bool,
    ) -> std::result::Result<Vec<Alert>, StoreError> {
        Ok(self
            .alerts
            .iter()
            .rev()
            .filter(|a| !active_only || (!a.resolved && !a.deleted))
            .take(limit)
            .cloned()
            .collect())
    }

    fn history(
        &mut self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        granularity: Granularity,
    ) -> std::result::Result<Vec<HistoryPoint>, StoreError> {
        let mut buckets: BTreeMap<NaiveDateTime, Vec<&Calculations>> = BTreeMap::new();
        for (ts, calc) in &self.calculations {
            if *ts >= start && *ts < end {
                buckets.entry(granularity.truncate(*ts)).or_default().push(calc);
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(timestamp, calcs)| {
                let n = calcs.len() as f64;
                let socs: Vec<f64> = calcs.iter().filter_map(|c| c.battery_soc).collect();
                HistoryPoint {
                    timestamp,
                    total_pv_power: calcs.iter().map(|c| c.total_pv_power).sum::<f64>() / n,
                    consumption_power: calcs.iter().map(|c| c.consumption_power).sum::<f64>() / n,
                    battery_power: calcs.iter().map(|c| c.battery_power).sum::<f64>() / n,
                    battery_soc: if socs.is_empty() {
                        None
                    } else {
                        Some(socs.iter().sum::<f64>() / socs.len() as f64)
                    },
                    daily_energy: calcs.iter().map(|c| c.daily_energy).fold(0.0, f64::max),
                    samples: calcs.len() as i64,
                }
            })
            .collect())
    }
}

pub struct PgStore {
    pub name: String,
    pub connectionstring: String,
    pub connector: MakeTlsConnector,
    pub conn: Option<postgres::Client>,
}

impl PgStore {
    pub fn new(name: &str, settings: &PostgresSettings) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls())?;
        builder.set_verify(SslVerifyMode::NONE); //allow self-signed certificates
        let connector = MakeTlsConnector::new(builder.build());

        let connectionstring = format!(
            "postgres://{}:{}@{}/{}?sslmode=require&application_name=pvwatch",
            settings.username, settings.password, settings.host, settings.dbname
        );

        Ok(Self {
            name: name.to_string(),
            connectionstring,
            connector,
            conn: None,
        })
    }

    fn client(&mut self) -> std::result::Result<&mut postgres::Client, StoreError> {
        if self.conn.is_none() {
            info!("🦏 {}: Connecting to database...", self.name);
            match postgres::Client::connect(&self.connectionstring, self.connector.clone()) {
                Ok(mut c) => {
                    c.batch_execute(CREATE_TABLES)?;
                    self.conn = Some(c);
                    info!("{}: Connected successfully", self.name);
                }
                Err(e) => {
                    error!("{}: PostgreSQL connection error: {:?}", self.name, e);
                    return Err(e.into());
                }
            }
        }
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    /// Drops the connection after a failed statement so the next call reconnects
    fn checked<T>(
        &mut self,
        query: &str,
        result: std::result::Result<T, StoreError>,
    ) -> std::result::Result<T, StoreError> {
        if let Err(e) = &result {
            if let StoreError::Database(_) = e {
                error!("{}: SQL error, query={:?}, error: {}", self.name, query, e);
                self.conn = None;
            }
        }
        result
    }
}

fn alert_from_row(row: &postgres::Row) -> std::result::Result<Option<Alert>, StoreError> {
    let severity: String = row.try_get("severity")?;
    let category: String = row.try_get("category")?;
    let (severity, category) = match (severity.parse(), category.parse()) {
        (Ok(s), Ok(c)) => (s, c),
        _ => {
            warn!(
                "skipping alert row with unknown severity/category: {:?}/{:?}",
                severity, category
            );
            return Ok(None);
        }
    };

    Ok(Some(Alert {
        id: Some(row.try_get("id")?),
        timestamp: row.try_get("ts")?,
        severity,
        category,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        component: row.try_get("component")?,
        value: row.try_get("value")?,
        threshold: row.try_get("threshold")?,
        acknowledged: row.try_get("acknowledged")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        resolved: row.try_get("resolved")?,
        resolved_at: row.try_get("resolved_at")?,
        deleted: row.try_get("deleted")?,
    }))
}

impl Store for PgStore {
    fn insert_measurement(
        &mut self,
        timestamp: NaiveDateTime,
        device_id: &str,
        field: &str,
        value: f64,
    ) -> std::result::Result<(), StoreError> {
        let result = self.client().and_then(|c| {
            Ok(c.execute(INSERT_MEASUREMENT, &[&timestamp, &device_id, &field, &value])?)
        });
        self.checked(INSERT_MEASUREMENT, result).map(|_| ())
    }

    fn insert_calculation(
        &mut self,
        timestamp: NaiveDateTime,
        calc: &Calculations,
    ) -> std::result::Result<(), StoreError> {
        let points = serde_json::to_value(&calc.points)?;
        let result = self.client().and_then(|c| {
            Ok(c.execute(
                INSERT_CALCULATION,
                &[
                    &timestamp,
                    &calc.total_pv_power,
                    &calc.consumption_power,
                    &calc.battery_power,
                    &calc.battery_soc,
                    &calc.battery_voltage,
                    &calc.daily_energy,
                    &calc.monthly_energy,
                    &calc.total_energy,
                    &points,
                ],
            )?)
        });
        self.checked(INSERT_CALCULATION, result).map(|_| ())
    }

    fn insert_cycle(
        &mut self,
        timestamp: NaiveDateTime,
        measurements: &[Measurement],
        calc: &Calculations,
    ) -> std::result::Result<(), StoreError> {
        let points = serde_json::to_value(&calc.points)?;
        let result = self.client().and_then(|c| {
            //dropping the transaction without commit rolls everything back
            let mut tx = c.transaction()?;
            for m in measurements {
                tx.execute(
                    INSERT_MEASUREMENT,
                    &[&timestamp, &m.device_id, &m.field, &m.value],
                )?;
            }
            tx.execute(
                INSERT_CALCULATION,
                &[
                    &timestamp,
                    &calc.total_pv_power,
                    &calc.consumption_power,
                    &calc.battery_power,
                    &calc.battery_soc,
                    &calc.battery_voltage,
                    &calc.daily_energy,
                    &calc.monthly_energy,
                    &calc.total_energy,
                    &points,
                ],
            )?;
            Ok(tx.commit()?)
        });
        self.checked("cycle transaction", result)
    }

    fn insert_alert(&mut self, alert: &Alert) -> std::result::Result<i64, StoreError> {
        let query = "insert into alerts (ts, severity, category, title, message, component, value, threshold) values ($1, $2, $3, $4, $5, $6, $7, $8) returning id";
        let result = self.client().and_then(|c| {
            let row = c.query_one(
                query,
                &[
                    &alert.timestamp,
                    &alert.severity.as_str(),
                    &alert.category.as_str(),
                    &alert.title,
                    &alert.message,
                    &alert.component,
                    &alert.value,
                    &alert.threshold,
                ],
            )?;
            Ok(row.try_get::<_, i64>("id")?)
        });
        self.checked(query, result)
    }

    fn update_alert(&mut self, id: i64, update: AlertUpdate) -> std::result::Result<(), StoreError> {
        let (query, at) = match update {
            AlertUpdate::Acknowledged(at) => (
                "update alerts set acknowledged=true, acknowledged_at=$2 where id=$1",
                at,
            ),
            AlertUpdate::Resolved(at) => (
                "update alerts set resolved=true, resolved_at=$2 where id=$1",
                at,
            ),
            AlertUpdate::Deleted(at) => (
                "update alerts set deleted=true, resolved=true, resolved_at=$2 where id=$1",
                at,
            ),
        };
        let result = self
            .client()
            .and_then(|c| Ok(c.execute(query, &[&id, &at])?));
        match self.checked(query, result)? {
            0 => Err(StoreError::UnknownAlert(id)),
            _ => Ok(()),
        }
    }

    fn list_alerts(
        &mut self,
        limit: usize,
        active_only: bool,
    ) -> std::result::Result<Vec<Alert>, StoreError> {
        let query = if active_only {
            "select * from alerts where not resolved and not deleted order by ts desc, id desc limit $1"
        } else {
            "select * from alerts order by ts desc, id desc limit $1"
        };
        let limit = limit as i64;
        let result = self
            .client()
            .and_then(|c| Ok(c.query(query, &[&limit])?));
        let rows = self.checked(query, result)?;

        let mut alerts = vec![];
        for row in &rows {
            if let Some(alert) = alert_from_row(row)? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }

    fn history(
        &mut self,
        start: NaiveDateTime,
        end: NaiveDateTime,
        granularity: Granularity,
    ) -> std::result::Result<Vec<HistoryPoint>, StoreError> {
        let query = "select date_trunc($1, ts) as bucket, avg(total_pv_power) as total_pv_power, avg(consumption_power) as consumption_power, avg(battery_power) as battery_power, avg(battery_soc) as battery_soc, max(daily_energy) as daily_energy, count(*) as samples from calculations where ts >= $2 and ts < $3 group by bucket order by bucket";
        let result = self
            .client()
            .and_then(|c| Ok(c.query(query, &[&granularity.as_str(), &start, &end])?));
        let rows = self.checked(query, result)?;

        let mut points = vec![];
        for row in &rows {
            points.push(HistoryPoint {
                timestamp: row.try_get("bucket")?,
                total_pv_power: row.try_get("total_pv_power")?,
                consumption_power: row.try_get("consumption_power")?,
                battery_power: row.try_get("battery_power")?,
                battery_soc: row.try_get("battery_soc")?,
                daily_energy: row.try_get("daily_energy")?,
                samples: row.try_get("samples")?,
            });
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::{AlertCategory, Severity};
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn on(day: u32, h: u32, m: u32, sec: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, day)
            .unwrap()
            .and_hms_opt(h, m, sec)
            .unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        on(1, h, m, 0)
    }

    fn alert(title: &str) -> Alert {
        Alert::new(
            at(9, 0),
            Severity::Warning,
            AlertCategory::Voltage,
            title,
            String::new(),
            "VD1",
            1.0,
            2.0,
        )
    }

    #[test]
    fn granularity_names_and_truncation() {
        assert_eq!(Granularity::from_name("DAY"), Granularity::Day);
        assert_eq!(Granularity::from_name("week"), Granularity::Hour);
        let ts = on(17, 13, 45, 10);
        assert_eq!(Granularity::Hour.truncate(ts), on(17, 13, 0, 0));
        assert_eq!(Granularity::Day.truncate(ts), on(17, 0, 0, 0));
        assert_eq!(Granularity::Month.truncate(ts), on(1, 0, 0, 0));
    }

    #[test]
    fn cycle_stores_measurements_with_calculation() {
        let mut store = MemoryStore::new();
        let rows = vec![
            Measurement {
                device_id: "VD1".to_string(),
                field: "V1D".to_string(),
                value: 200.0,
            },
            Measurement {
                device_id: "VD1".to_string(),
                field: "I1D".to_string(),
                value: 5.0,
            },
        ];
        store.insert_cycle(at(12, 0), &rows, &Calculations::default()).unwrap();
        assert_eq!(store.measurements.len(), 2);
        assert_eq!(store.measurements[1], (at(12, 0), "VD1".to_string(), "I1D".to_string(), 5.0));
        assert_eq!(store.calculations.len(), 1);
    }

    #[test]
    fn alert_ids_and_lifecycle() {
        let mut store = MemoryStore::new();
        let first = store.insert_alert(&alert("a")).unwrap();
        let second = store.insert_alert(&alert("b")).unwrap();
        assert_ne!(first, second);

        store.update_alert(first, AlertUpdate::Acknowledged(at(10, 0))).unwrap();
        store.update_alert(second, AlertUpdate::Deleted(at(10, 5))).unwrap();
        assert!(matches!(
            store.update_alert(99, AlertUpdate::Resolved(at(10, 0))),
            Err(StoreError::UnknownAlert(99))
        ));

        let all = store.list_alerts(10, false).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, Some(second));
        assert!(all[0].deleted && all[0].resolved);
        assert_eq!(all[0].resolved_at, Some(at(10, 5)));

        let active = store.list_alerts(10, true).unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].acknowledged);
        assert!(!active[0].resolved);
    }

    #[test]
    fn history_buckets_average_calculations() {
        let mut store = MemoryStore::new();
        for (ts, pv, daily) in &[(at(10, 0), 100.0, 1.0), (at(10, 30), 300.0, 1.5), (at(11, 0), 50.0, 2.0)] {
            let calc = Calculations {
                total_pv_power: *pv,
                daily_energy: *daily,
                ..Default::default()
            };
            store.insert_calculation(*ts, &calc).unwrap();
        }

        let points = store.history(at(0, 0), at(23, 0), Granularity::Hour).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp, at(10, 0));
        assert_relative_eq!(points[0].total_pv_power, 200.0);
        assert_relative_eq!(points[0].daily_energy, 1.5);
        assert_eq!(points[0].samples, 2);
        assert_eq!(points[0].battery_soc, None);

        let points = store.history(at(0, 0), at(23, 0), Granularity::Day).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].samples, 3);

        assert!(store.history(at(12, 0), at(13, 0), Granularity::Hour).unwrap().is_empty());
    }
}
