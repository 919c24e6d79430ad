use crate::accumulator::Calculations;
use crate::frame::{DeviceReading, StructuredReading};
use crate::thresholds::ThresholdSet;
use crate::topology::{Category, Topology};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// uncategorised DC voltage above this is assumed to come from a PV string
pub const PV_HEURISTIC_CUTOFF_V: f64 = 10.0;
/// "low" voltage is only reported above this, anything below is a dead input
pub const VOLTAGE_FLOOR_V: f64 = 10.0;
/// power comparisons below this are noise
pub const DISCREPANCY_FLOOR_W: f64 = 100.0;

pub const REFERENCE_COMPONENT_PREFIX: &str = "INVD";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(Severity::Info),
            "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            _ => Err(format!("invalid severity: {:?}", s)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Voltage,
    Current,
    Power,
    Temperature,
    Communication,
    Discrepancy,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Voltage => "voltage",
            AlertCategory::Current => "current",
            AlertCategory::Power => "power",
            AlertCategory::Temperature => "temperature",
            AlertCategory::Communication => "communication",
            AlertCategory::Discrepancy => "discrepancy",
        }
    }
}

impl FromStr for AlertCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "voltage" => Ok(AlertCategory::Voltage),
            "current" => Ok(AlertCategory::Current),
            "power" => Ok(AlertCategory::Power),
            "temperature" => Ok(AlertCategory::Temperature),
            "communication" => Ok(AlertCategory::Communication),
            "discrepancy" => Ok(AlertCategory::Discrepancy),
            _ => Err(format!("invalid alert category: {:?}", s)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    /// unset until the store assigns one
    pub id: Option<i64>,
    pub timestamp: NaiveDateTime,
    pub severity: Severity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub component: String,
    pub value: f64,
    pub threshold: f64,
    pub acknowledged: bool,
    pub acknowledged_at: Option<NaiveDateTime>,
    pub resolved: bool,
    pub resolved_at: Option<NaiveDateTime>,
    pub deleted: bool,
}

impl Alert {
    pub fn new(
        timestamp: NaiveDateTime,
        severity: Severity,
        category: AlertCategory,
        title: &str,
        message: String,
        component: &str,
        value: f64,
        threshold: f64,
    ) -> Self {
        Self {
            id: None,
            timestamp,
            severity,
            category,
            title: title.to_string(),
            message,
            component: component.to_string(),
            value,
            threshold,
            acknowledged: false,
            acknowledged_at: None,
            resolved: false,
            resolved_at: None,
            deleted: false,
        }
    }

    /// Deduplication key: the same condition on the same component
    pub fn signature(&self) -> String {
        format!("{}_{}_{}", self.category.as_str(), self.component, self.title)
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {} ({})",
            self.severity.as_str(),
            self.title,
            self.message,
            self.component
        )
    }
}

/// Summary values reported by the inverter itself
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceReading {
    pub pv1_v: Option<f64>,
    pub pv1_i: Option<f64>,
    pub pv2_v: Option<f64>,
    pub pv2_i: Option<f64>,
    pub vbat: Option<f64>,
    pub ibat: Option<f64>,
}

impl ReferenceReading {
    pub fn from_device(device: &DeviceReading) -> Self {
        Self {
            pv1_v: device.number("PV1_V"),
            pv1_i: device.number("PV1_I"),
            pv2_v: device.number("PV2_V"),
            pv2_i: device.number("PV2_I"),
            vbat: device.number("Vbat"),
            ibat: device.number("Ibat"),
        }
    }

    pub fn pv_power(&self) -> f64 {
        self.pv1_v.unwrap_or(0.0) * self.pv1_i.unwrap_or(0.0)
            + self.pv2_v.unwrap_or(0.0) * self.pv2_i.unwrap_or(0.0)
    }

    pub fn battery_power(&self) -> f64 {
        self.vbat.unwrap_or(0.0) * self.ibat.unwrap_or(0.0)
    }
}

fn is_dc_voltage_field(name: &str) -> bool {
    name == "V" || (name.starts_with('V') && name.contains('D'))
}

fn is_dc_current_field(name: &str) -> bool {
    name == "I" || (name.starts_with('I') && name.contains('D'))
}

/// Runs every rule family against one cycle's data, stamping alerts with `now`.
/// Disconnection findings come first since they explain the other anomalies.
pub fn analyze(
    reading: &StructuredReading,
    calculations: Option<&Calculations>,
    reference: Option<&ReferenceReading>,
    thresholds: &ThresholdSet,
    topology: &Topology,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let mut alerts = vec![];
    alerts.extend(check_nan_values(reading, now));
    alerts.extend(check_voltages(reading, reference, thresholds, topology, now));
    alerts.extend(check_currents(reading, reference, thresholds, topology, now));
    if let (Some(calc), Some(reference)) = (calculations, reference) {
        alerts.extend(check_power_discrepancy(calc, reference, thresholds, now));
    }
    alerts.extend(check_temperature(reading, thresholds, now));
    alerts.extend(check_communication(reading, thresholds, now));
    alerts
}

pub fn check_nan_values(reading: &StructuredReading, now: NaiveDateTime) -> Vec<Alert> {
    let mut alerts = vec![];
    for device in &reading.devices {
        let nan_fields: Vec<&str> = device
            .fields
            .iter()
            .filter(|(_, v)| v.is_nan())
            .map(|(name, _)| name.as_str())
            .collect();
        let total = device.fields.len();
        let nan_count = nan_fields.len();

        if nan_count == 0 {
            continue;
        }
        if nan_count == total {
            alerts.push(Alert::new(
                now,
                Severity::Critical,
                AlertCategory::Communication,
                "Measurement Board Disconnected",
                format!(
                    "Measurement board {} is completely disconnected - all fields returning NaN",
                    device.device_id
                ),
                &device.device_id,
                nan_count as f64,
                0.0,
            ));
        } else {
            alerts.push(Alert::new(
                now,
                Severity::Error,
                AlertCategory::Communication,
                "Sensor Malfunction",
                format!(
                    "Measurement board {} has {}/{} fields with NaN values ({})",
                    device.device_id,
                    nan_count,
                    total,
                    nan_fields.join(", ")
                ),
                &device.device_id,
                nan_count as f64,
                0.0,
            ));
        }
    }
    alerts
}

pub fn check_voltages(
    reading: &StructuredReading,
    reference: Option<&ReferenceReading>,
    thresholds: &ThresholdSet,
    topology: &Topology,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let limits = &thresholds.voltage;
    let mut alerts = vec![];

    for device in &reading.devices {
        let category = topology.device_category(&device.device_id);
        let id = device.device_id.as_str();

        for (name, value) in &device.fields {
            let value = match value.as_number() {
                Some(v) if is_dc_voltage_field(name) => v,
                _ => continue,
            };

            let treat_as_pv = category == Category::Solar
                || (category == Category::Other && value > PV_HEURISTIC_CUTOFF_V);
            if treat_as_pv {
                if value > limits.pv_max {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Voltage,
                        "High PV Voltage",
                        format!(
                            "PV voltage from {} ({:.1}V) exceeds maximum ({}V)",
                            id, value, limits.pv_max
                        ),
                        id,
                        value,
                        limits.pv_max,
                    ));
                } else if value < limits.pv_min && value > VOLTAGE_FLOOR_V {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Voltage,
                        "Low PV Voltage",
                        format!(
                            "PV voltage from {} ({:.1}V) below minimum ({}V)",
                            id, value, limits.pv_min
                        ),
                        id,
                        value,
                        limits.pv_min,
                    ));
                }
            } else if category == Category::Battery {
                if value > limits.battery_max {
                    alerts.push(Alert::new(
                        now,
                        Severity::Error,
                        AlertCategory::Voltage,
                        "High Battery Voltage",
                        format!(
                            "Battery voltage from {} ({:.1}V) exceeds maximum ({}V)",
                            id, value, limits.battery_max
                        ),
                        "battery",
                        value,
                        limits.battery_max,
                    ));
                } else if value < limits.battery_min && value > VOLTAGE_FLOOR_V {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Voltage,
                        "Low Battery Voltage",
                        format!(
                            "Battery voltage from {} ({:.1}V) below minimum ({}V)",
                            id, value, limits.battery_min
                        ),
                        "battery",
                        value,
                        limits.battery_min,
                    ));
                }
            }
        }
    }

    if let Some(reference) = reference {
        for (num, value) in [(1, reference.pv1_v), (2, reference.pv2_v)].iter() {
            if let Some(value) = value {
                if *value > limits.pv_max {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Voltage,
                        &format!("High Inverter PV{} Voltage", num),
                        format!(
                            "Inverter PV{} voltage ({:.1}V) exceeds maximum ({}V)",
                            num, value, limits.pv_max
                        ),
                        &format!("{}_PV{}", REFERENCE_COMPONENT_PREFIX, num),
                        *value,
                        limits.pv_max,
                    ));
                }
            }
        }

        if let Some(value) = reference.vbat {
            if value > limits.battery_max {
                alerts.push(Alert::new(
                    now,
                    Severity::Error,
                    AlertCategory::Voltage,
                    "High Battery Voltage",
                    format!(
                        "Battery voltage ({:.1}V) exceeds maximum ({}V)",
                        value, limits.battery_max
                    ),
                    "battery",
                    value,
                    limits.battery_max,
                ));
            } else if value < limits.battery_min {
                alerts.push(Alert::new(
                    now,
                    Severity::Warning,
                    AlertCategory::Voltage,
                    "Low Battery Voltage",
                    format!(
                        "Battery voltage ({:.1}V) below minimum ({}V)",
                        value, limits.battery_min
                    ),
                    "battery",
                    value,
                    limits.battery_min,
                ));
            }
        }
    }

    alerts
}

pub fn check_currents(
    reading: &StructuredReading,
    reference: Option<&ReferenceReading>,
    thresholds: &ThresholdSet,
    topology: &Topology,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let limits = &thresholds.current;
    let mut alerts = vec![];

    for device in &reading.devices {
        let category = topology.device_category(&device.device_id);
        let id = device.device_id.as_str();

        for (name, value) in &device.fields {
            let value = match value.as_number() {
                Some(v) if is_dc_current_field(name) => v,
                _ => continue,
            };
            match category {
                Category::Solar if value > limits.max_pv_current => {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Current,
                        "High PV Current",
                        format!(
                            "PV current from {} ({:.1}A) exceeds maximum ({}A)",
                            id, value, limits.max_pv_current
                        ),
                        id,
                        value,
                        limits.max_pv_current,
                    ));
                }
                Category::Battery if value > limits.max_battery_current => {
                    alerts.push(Alert::new(
                        now,
                        Severity::Warning,
                        AlertCategory::Current,
                        "High Battery Current",
                        format!(
                            "Battery current from {} ({:.1}A) exceeds maximum ({}A)",
                            id, value, limits.max_battery_current
                        ),
                        "battery",
                        value,
                        limits.max_battery_current,
                    ));
                }
                _ => (),
            }
        }
    }

    //battery current is signed by flow direction
    if let Some(value) = reference.and_then(|r| r.ibat).map(f64::abs) {
        if value > limits.max_battery_current {
            alerts.push(Alert::new(
                now,
                Severity::Error,
                AlertCategory::Current,
                "High Battery Current",
                format!(
                    "Battery current ({:.1}A) exceeds maximum ({}A)",
                    value, limits.max_battery_current
                ),
                "battery",
                value,
                limits.max_battery_current,
            ));
        }
    }

    alerts
}

fn relative_difference(a: f64, b: f64) -> f64 {
    (a - b).abs() / a.max(b) * 100.0
}

pub fn check_power_discrepancy(
    calculations: &Calculations,
    reference: &ReferenceReading,
    thresholds: &ThresholdSet,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let ceiling = thresholds.power_discrepancy.max_percentage;
    let mut alerts = vec![];

    let sensor_pv = calculations.total_pv_power;
    let reference_pv = reference.pv_power();
    if sensor_pv > DISCREPANCY_FLOOR_W && reference_pv > DISCREPANCY_FLOOR_W {
        let diff = relative_difference(sensor_pv, reference_pv);
        if diff > ceiling {
            alerts.push(Alert::new(
                now,
                Severity::Warning,
                AlertCategory::Discrepancy,
                "PV Power Mismatch",
                format!(
                    "Sensor PV power ({:.0}W) differs from inverter ({:.0}W) by {:.1}%",
                    sensor_pv, reference_pv, diff
                ),
                "solar",
                diff,
                ceiling,
            ));
        }
    }

    let sensor_battery = calculations.battery_power;
    let reference_battery = reference.battery_power();
    if sensor_battery.abs() > DISCREPANCY_FLOOR_W && reference_battery.abs() > DISCREPANCY_FLOOR_W {
        let diff = relative_difference(sensor_battery.abs(), reference_battery.abs());
        if diff > ceiling {
            alerts.push(Alert::new(
                now,
                Severity::Info,
                AlertCategory::Discrepancy,
                "Battery Power Mismatch",
                format!(
                    "Sensor battery power ({:.0}W) differs from inverter ({:.0}W) by {:.1}%",
                    sensor_battery, reference_battery, diff
                ),
                "battery",
                diff,
                ceiling,
            ));
        }
    }

    alerts
}

pub fn check_temperature(
    reading: &StructuredReading,
    thresholds: &ThresholdSet,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let limits = &thresholds.temperature;
    let mut alerts = vec![];

    for device in &reading.devices {
        if let Some(value) = device.number("T_m") {
            if value > limits.panel_max {
                alerts.push(Alert::new(
                    now,
                    Severity::Warning,
                    AlertCategory::Temperature,
                    "High Panel Temperature",
                    format!(
                        "Panel temperature ({:.1}°C) exceeds maximum ({}°C)",
                        value, limits.panel_max
                    ),
                    &device.device_id,
                    value,
                    limits.panel_max,
                ));
            }
        }

        //ambient extremes do not threaten the hardware, informational only
        if let Some(value) = device.number("T_amb") {
            if value > limits.ambient_max {
                alerts.push(Alert::new(
                    now,
                    Severity::Info,
                    AlertCategory::Temperature,
                    "High Ambient Temperature",
                    format!("Ambient temperature ({:.1}°C) is very high", value),
                    "environment",
                    value,
                    limits.ambient_max,
                ));
            } else if value < limits.ambient_min {
                alerts.push(Alert::new(
                    now,
                    Severity::Info,
                    AlertCategory::Temperature,
                    "Low Ambient Temperature",
                    format!("Ambient temperature ({:.1}°C) is very low", value),
                    "environment",
                    value,
                    limits.ambient_min,
                ));
            }
        }
    }

    alerts
}

pub fn check_communication(
    reading: &StructuredReading,
    thresholds: &ThresholdSet,
    now: NaiveDateTime,
) -> Vec<Alert> {
    let min_rssi = thresholds.communication.min_rssi;
    reading
        .devices
        .iter()
        .filter_map(|device| {
            let value = device.number("Rssi").or_else(|| device.number("RSSI"))?;
            if value < min_rssi {
                Some(Alert::new(
                    now,
                    Severity::Warning,
                    AlertCategory::Communication,
                    "Weak Signal Strength",
                    format!(
                        "Measurement board {} has weak signal (RSSI: {})",
                        device.device_id, value
                    ),
                    &device.device_id,
                    value,
                    min_rssi,
                ))
            } else {
                None
            }
        })
        .collect()
}
