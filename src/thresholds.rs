use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageThresholds {
    pub pv_min: f64,
    pub pv_max: f64,
    pub battery_min: f64,
    pub battery_max: f64,
    pub ac_min: f64,
    pub ac_max: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentThresholds {
    pub max_pv_current: f64,
    pub max_battery_current: f64,
    pub max_ac_current: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyThresholds {
    /// max % difference between sensor and reference power
    pub max_percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TemperatureThresholds {
    pub panel_max: f64,
    pub ambient_max: f64,
    pub ambient_min: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommunicationThresholds {
    pub min_rssi: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub voltage: VoltageThresholds,
    pub current: CurrentThresholds,
    pub power_discrepancy: DiscrepancyThresholds,
    pub temperature: TemperatureThresholds,
    pub communication: CommunicationThresholds,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            voltage: VoltageThresholds {
                pv_min: 150.0,
                pv_max: 450.0,
                battery_min: 42.0,
                battery_max: 58.0,
                ac_min: 198.0,
                ac_max: 264.0,
            },
            current: CurrentThresholds {
                max_pv_current: 30.0,
                max_battery_current: 100.0,
                max_ac_current: 50.0,
            },
            power_discrepancy: DiscrepancyThresholds {
                max_percentage: 15.0,
            },
            temperature: TemperatureThresholds {
                panel_max: 85.0,
                ambient_max: 50.0,
                ambient_min: -10.0,
            },
            communication: CommunicationThresholds { min_rssi: -90.0 },
        }
    }
}

/// Ratings taken from the inverter/battery datasheet
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Datasheet {
    pub string_voltage: Option<f64>,
    pub string_current: Option<f64>,
    pub max_dc_current: Option<f64>,
    pub nominal_battery_voltage: Option<f64>,
}

impl ThresholdSet {
    /// Defaults narrowed by fixed safety margins around datasheet ratings
    pub fn from_datasheet(sheet: &Datasheet) -> Self {
        let mut t = ThresholdSet::default();

        if let Some(v) = sheet.string_voltage {
            t.voltage.pv_max = v * 1.2;
            t.voltage.pv_min = v * 0.5;
            info!(
                "thresholds: PV voltage derived from datasheet: {}-{} V",
                t.voltage.pv_min, t.voltage.pv_max
            );
        }
        if let Some(i) = sheet.string_current {
            t.current.max_pv_current = i * 1.2;
            info!(
                "thresholds: max PV current derived from datasheet: {} A",
                t.current.max_pv_current
            );
        }
        if let Some(i) = sheet.max_dc_current {
            t.current.max_battery_current = i;
            info!("thresholds: max battery current from datasheet: {} A", i);
        }
        if let Some(v) = sheet.nominal_battery_voltage {
            t.voltage.battery_min = v * 0.875;
            t.voltage.battery_max = v * 1.208;
            info!(
                "thresholds: battery voltage derived from nominal {} V: {}-{} V",
                v, t.voltage.battery_min, t.voltage.battery_max
            );
        }
        t
    }

    /// Sets a single bound addressed as `group.name`, e.g. `voltage.pv_min`
    pub fn set(&mut self, key: &str, value: f64) -> bool {
        let slot = match key.trim() {
            "voltage.pv_min" => &mut self.voltage.pv_min,
            "voltage.pv_max" => &mut self.voltage.pv_max,
            "voltage.battery_min" => &mut self.voltage.battery_min,
            "voltage.battery_max" => &mut self.voltage.battery_max,
            "voltage.ac_min" => &mut self.voltage.ac_min,
            "voltage.ac_max" => &mut self.voltage.ac_max,
            "current.max_pv_current" => &mut self.current.max_pv_current,
            "current.max_battery_current" => &mut self.current.max_battery_current,
            "current.max_ac_current" => &mut self.current.max_ac_current,
            "power_discrepancy.max_percentage" => &mut self.power_discrepancy.max_percentage,
            "temperature.panel_max" => &mut self.temperature.panel_max,
            "temperature.ambient_max" => &mut self.temperature.ambient_max,
            "temperature.ambient_min" => &mut self.temperature.ambient_min,
            "communication.min_rssi" => &mut self.communication.min_rssi,
            _ => return false,
        };
        *slot = value;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_datasheet_keeps_defaults() {
        assert_eq!(
            ThresholdSet::from_datasheet(&Datasheet::default()),
            ThresholdSet::default()
        );
    }

    #[test]
    fn datasheet_margins() {
        let t = ThresholdSet::from_datasheet(&Datasheet {
            string_voltage: Some(400.0),
            string_current: Some(10.0),
            max_dc_current: Some(80.0),
            nominal_battery_voltage: Some(48.0),
        });
        assert_relative_eq!(t.voltage.pv_max, 480.0);
        assert_relative_eq!(t.voltage.pv_min, 200.0);
        assert_relative_eq!(t.current.max_pv_current, 12.0);
        assert_relative_eq!(t.current.max_battery_current, 80.0);
        assert_relative_eq!(t.voltage.battery_min, 42.0);
        assert_relative_eq!(t.voltage.battery_max, 57.984, epsilon = 1e-9);
    }

    #[test]
    fn set_by_key() {
        let mut t = ThresholdSet::default();
        assert!(t.set("communication.min_rssi", -80.0));
        assert!(!t.set("voltage.dc_min", 1.0));
        assert_relative_eq!(t.communication.min_rssi, -80.0);
    }
}
