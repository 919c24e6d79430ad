use crate::frame::StructuredReading;
use crate::topology::{is_string_point, Category, Topology};
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// fields containing this are the board's own supply voltage, not a measurement
pub const BATTERY_VOLTAGE_MARKER: &str = "bat";

//(band upper edge, voltage at 0%, voltage at 100%) for 12/24/48V systems
const SOC_BANDS: [(f64, f64, f64); 3] = [
    (18.0, 11.6, 12.8),
    (36.0, 23.2, 25.6),
    (f64::INFINITY, 46.4, 51.2),
];

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PointStatus {
    /// neither voltage nor current available
    Disconnected,
    /// only one of voltage/current available, power unknown
    Incomplete,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PointCalculation {
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub soc: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PointStatus>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Calculations {
    pub points: BTreeMap<String, PointCalculation>,
    pub total_pv_power: f64,
    pub consumption_power: f64,
    pub battery_power: f64,
    pub battery_soc: Option<f64>,
    pub battery_voltage: Option<f64>,
    pub daily_energy: f64,
    pub monthly_energy: f64,
    pub total_energy: f64,
}

/// Energy counters carried from one cycle to the next.
/// Owned by the single processing path; nothing else mutates it.
#[derive(Clone, Debug, Default)]
pub struct AccumulatorState {
    /// kWh per point since the start of the current day
    pub per_point_energy: HashMap<String, f64>,
    pub daily_energy: f64,
    pub monthly_energy: f64,
    pub total_energy: f64,
    pub last_calculation: Option<NaiveDateTime>,
    pub current_day: Option<NaiveDate>,
    pub current_month: Option<(i32, u32)>,
}

impl AccumulatorState {
    fn roll_calendar(&mut self, now: NaiveDateTime) {
        let today = now.date();
        if let Some(day) = self.current_day {
            if day != today {
                info!(
                    "accumulator: day rollover {} -> {}, daily energy was {:.3} kWh",
                    day, today, self.daily_energy
                );
                self.daily_energy = 0.0;
                self.per_point_energy.clear();
            }
        }
        self.current_day = Some(today);

        let month = (today.year(), today.month());
        if let Some(current) = self.current_month {
            if current != month {
                info!(
                    "accumulator: month rollover, monthly energy was {:.3} kWh",
                    self.monthly_energy
                );
                self.monthly_energy = 0.0;
            }
        }
        self.current_month = Some(month);
    }

    fn elapsed_hours(&mut self, now: NaiveDateTime) -> f64 {
        let elapsed = match self.last_calculation {
            //clock going backwards integrates nothing
            Some(last) if now > last => (now - last).num_milliseconds() as f64 / 3_600_000.0,
            _ => 0.0,
        };
        self.last_calculation = Some(now);
        elapsed
    }
}

/// State of charge estimated from terminal voltage, 0..100 %
pub fn estimate_soc(voltage: f64) -> f64 {
    let (low, high) = SOC_BANDS
        .iter()
        .find(|(edge, _, _)| voltage < *edge)
        .map(|(_, low, high)| (*low, *high))
        .unwrap_or((SOC_BANDS[2].1, SOC_BANDS[2].2));
    ((voltage - low) / (high - low) * 100.0).max(0.0).min(100.0)
}

fn is_voltage_field(name: &str) -> bool {
    name.starts_with('V') && !name.to_ascii_lowercase().contains(BATTERY_VOLTAGE_MARKER)
}

fn is_current_field(name: &str) -> bool {
    name.starts_with('I') || name.starts_with('A')
}

/// One integration step: per-point electrical values, system totals and energy counters.
pub fn calculate(
    state: &mut AccumulatorState,
    reading: &StructuredReading,
    topology: &Topology,
    now: NaiveDateTime,
) -> Calculations {
    let elapsed_hours = state.elapsed_hours(now);
    state.roll_calendar(now);

    let mut calc = Calculations::default();

    for (point_id, devices) in topology.assignments() {
        let mut voltage: Option<f64> = None;
        let mut current: Option<f64> = None;

        for device in devices.iter().filter_map(|id| reading.device(id)) {
            for (name, value) in &device.fields {
                let v = match value.as_number() {
                    Some(v) => v,
                    None => continue,
                };
                if voltage.is_none() && is_voltage_field(name) {
                    voltage = Some(v);
                } else if current.is_none() && is_current_field(name) {
                    current = Some(v);
                }
            }
        }

        let category = topology.point_category(point_id);
        let (v, i) = match (voltage, current) {
            (Some(v), Some(i)) => (v, i),
            (None, None) => {
                debug!("accumulator: point {} has no usable data", point_id);
                calc.points.insert(
                    point_id.clone(),
                    PointCalculation {
                        status: Some(PointStatus::Disconnected),
                        ..Default::default()
                    },
                );
                continue;
            }
            _ => {
                debug!(
                    "accumulator: point {} incomplete (voltage {:?}, current {:?})",
                    point_id, voltage, current
                );
                let mut point = PointCalculation {
                    voltage,
                    current,
                    status: Some(PointStatus::Incomplete),
                    ..Default::default()
                };
                //terminal voltage alone is enough for the charge estimate
                if let (Category::Battery, Some(v)) = (category, voltage) {
                    record_battery_voltage(&mut calc, &mut point, v);
                }
                calc.points.insert(point_id.clone(), point);
                continue;
            }
        };

        let power = v * i;
        let mut point = PointCalculation {
            voltage: Some(v),
            current: Some(i),
            power: Some(power),
            ..Default::default()
        };

        match category {
            Category::Solar => add_pv(state, &mut calc, &mut point, point_id, power, elapsed_hours),
            Category::Inverter => calc.consumption_power += power,
            Category::Battery => {
                calc.battery_power += power;
                record_battery_voltage(&mut calc, &mut point, v);
            }
            Category::Other if is_string_point(point_id) => {
                add_pv(state, &mut calc, &mut point, point_id, power, elapsed_hours)
            }
            Category::Other => (),
        }

        calc.points.insert(point_id.clone(), point);
    }

    calc.daily_energy = state.daily_energy;
    calc.monthly_energy = state.monthly_energy;
    calc.total_energy = state.total_energy;
    calc
}

fn record_battery_voltage(calc: &mut Calculations, point: &mut PointCalculation, voltage: f64) {
    let soc = estimate_soc(voltage);
    calc.battery_voltage = Some(voltage);
    calc.battery_soc = Some(soc);
    point.soc = Some(soc);
}

fn add_pv(
    state: &mut AccumulatorState,
    calc: &mut Calculations,
    point: &mut PointCalculation,
    point_id: &str,
    power: f64,
    elapsed_hours: f64,
) {
    calc.total_pv_power += power;

    let increment = power / 1000.0 * elapsed_hours;
    let energy = state
        .per_point_energy
        .entry(point_id.to_string())
        .or_insert(0.0);
    //generation only ratchets upwards
    if increment > 0.0 {
        *energy += increment;
        state.daily_energy += increment;
        state.monthly_energy += increment;
        state.total_energy += increment;
    }
    point.energy = Some(*energy);
}
