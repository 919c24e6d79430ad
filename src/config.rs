extern crate ini;

use self::ini::{Ini, Properties};
use crate::asyncfile::baud_rate;
use crate::schema::{Schema, SchemaEntry};
use crate::thresholds::{Datasheet, ThresholdSet};
use crate::topology::{Category, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// Just a generic Result type to ease error handling for us. Errors in multithreaded
// async contexts needs some extra restrictions
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub const DEFAULT_CONFIG_FILE: &str = "pvwatch.conf";
pub const DEFAULT_REFERENCE_DEVICE: &str = "INVD";
pub const DEFAULT_SAMPLE_DELAY: u32 = 8;
pub const DEFAULT_BAUD: u32 = 9600;

#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    pub device: Option<String>,
    pub command_timeout: Duration,
    pub reconnect_delay: Duration,
    /// controller sampling period in seconds
    pub delay: u32,
    pub baud: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: None,
            command_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(10),
            delay: DEFAULT_SAMPLE_DELAY,
            baud: DEFAULT_BAUD,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WebSettings {
    pub address: String,
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PostgresSettings {
    pub host: String,
    pub dbname: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisSettings {
    pub enabled: bool,
    pub notifications: bool,
}

impl Default for DiagnosisSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            notifications: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub log: Option<String>,
    pub reference_device: String,
    pub serial: SerialSettings,
    pub webserver: WebSettings,
    pub postgres: Option<PostgresSettings>,
    pub schema: Schema,
    pub topology: Topology,
    pub thresholds: ThresholdSet,
    pub diagnosis: DiagnosisSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: None,
            reference_device: DEFAULT_REFERENCE_DEVICE.to_string(),
            serial: SerialSettings::default(),
            webserver: WebSettings::default(),
            postgres: None,
            schema: Schema::default(),
            topology: Topology::default(),
            thresholds: ThresholdSet::default(),
            diagnosis: DiagnosisSettings::default(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_f64(section: &Properties, key: &str) -> Option<f64> {
    let value = section.get(key)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("config: invalid number for {}: {:?}, ignoring", key, value);
            None
        }
    }
}

fn parse_duration(section: &Properties, key: &str, default: Duration) -> Duration {
    match section.get(key) {
        Some(value) => humantime::parse_duration(value.trim()).unwrap_or_else(|e| {
            warn!("config: invalid duration for {}: {:?} ({}), using default", key, value, e);
            default
        }),
        None => default,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Settings {
    pub fn load(path: &str) -> Result<Self> {
        let conf = Ini::load_from_file(path)?;
        Ok(Settings::from_ini(&conf))
    }

    /// Builds settings from parsed ini; any missing piece falls back to its default
    pub fn from_ini(conf: &Ini) -> Self {
        let mut settings = Settings::default();

        if let Some(section) = conf.section(Some("general")) {
            settings.log = section.get("log").map(String::from);
            if let Some(device) = section.get("reference_device") {
                settings.reference_device = device.trim().to_string();
            }
        }

        if let Some(section) = conf.section(Some("serial")) {
            let defaults = SerialSettings::default();
            settings.serial = SerialSettings {
                device: section.get("device").map(|d| d.trim().to_string()),
                command_timeout: parse_duration(section, "command_timeout", defaults.command_timeout),
                reconnect_delay: parse_duration(section, "reconnect_delay", defaults.reconnect_delay),
                delay: section
                    .get("delay")
                    .and_then(|d| d.trim().parse().ok())
                    .unwrap_or(defaults.delay),
                baud: match section.get("baud").map(|b| b.trim().parse::<u32>()) {
                    None => defaults.baud,
                    Some(Ok(baud)) if baud_rate(baud).is_some() => baud,
                    Some(_) => {
                        warn!(
                            "config: unsupported [serial] baud {:?}, using {}",
                            section.get("baud"),
                            defaults.baud
                        );
                        defaults.baud
                    }
                },
            };
        }

        if let Some(section) = conf.section(Some("webserver")) {
            if let Some(address) = section.get("address") {
                settings.webserver.address = address.trim().to_string();
            }
            if let Some(port) = section.get("port") {
                match port.trim().parse() {
                    Ok(p) => settings.webserver.port = p,
                    Err(_) => warn!("config: invalid webserver port: {:?}", port),
                }
            }
        }

        if let Some(section) = conf.section(Some("postgres")) {
            match (
                section.get("host"),
                section.get("dbname"),
                section.get("username"),
                section.get("password"),
            ) {
                (Some(host), Some(dbname), Some(username), Some(password)) => {
                    settings.postgres = Some(PostgresSettings {
                        host: host.to_string(),
                        dbname: dbname.to_string(),
                        username: username.to_string(),
                        password: password.to_string(),
                    })
                }
                _ => warn!("config: postgres section is incomplete, ignoring it"),
            }
        }

        if let Some(section) = conf.section(Some("schema")) {
            let mut entries = vec![];
            for (device_id, fields) in section.iter() {
                match SchemaEntry::from_definition(device_id, fields) {
                    Some(entry) => entries.push(entry),
                    None => warn!("config: schema entry {:?} has no fields, skipping", device_id),
                }
            }
            settings.schema = Schema::new(entries);
        }

        let assignments: Vec<(String, Vec<String>)> = conf
            .section(Some("assignments"))
            .map(|section| {
                section
                    .iter()
                    .map(|(point, devices)| (point.to_string(), split_list(devices)))
                    .collect()
            })
            .unwrap_or_default();
        let categories: HashMap<String, Category> = conf
            .section(Some("categories"))
            .map(|section| {
                section
                    .iter()
                    .map(|(point, category)| (point.to_string(), Category::from_name(category)))
                    .collect()
            })
            .unwrap_or_default();
        settings.topology = Topology::new(assignments, categories);

        settings.thresholds = match conf.section(Some("thresholds")) {
            Some(section) => {
                let mut thresholds = ThresholdSet::default();
                for (key, _) in section.iter() {
                    if let Some(value) = parse_f64(section, key) {
                        if !thresholds.set(key, value) {
                            warn!("config: unknown threshold {:?}, ignoring", key);
                        }
                    }
                }
                thresholds
            }
            None => match conf.section(Some("datasheet")) {
                Some(section) => ThresholdSet::from_datasheet(&Datasheet {
                    string_voltage: parse_f64(section, "string_voltage"),
                    string_current: parse_f64(section, "string_current"),
                    max_dc_current: parse_f64(section, "max_dc_current"),
                    nominal_battery_voltage: parse_f64(section, "nominal_battery_voltage"),
                }),
                None => ThresholdSet::default(),
            },
        };

        if let Some(section) = conf.section(Some("diagnosis")) {
            let defaults = DiagnosisSettings::default();
            settings.diagnosis = DiagnosisSettings {
                enabled: section
                    .get("enabled")
                    .and_then(parse_bool)
                    .unwrap_or(defaults.enabled),
                notifications: section
                    .get("notifications")
                    .and_then(parse_bool)
                    .unwrap_or(defaults.notifications),
            };
        }

        settings
    }
}

pub fn log_location(path: &str) -> Option<String> {
    let conf = Ini::load_from_file(path).ok()?;
    conf.section(Some("general"))
        .and_then(|x| x.get("log").map(String::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[general]
log = /tmp/pvwatch.log

[serial]
device = /dev/ttyUSB0
command_timeout = 500ms
delay = 5
baud = 115200

[webserver]
port = 8080

[postgres]
host = localhost
dbname = pv

[schema]
VD1 = V1D,I1D
ENV = T_amb, Rssi
VD3 = V3D,I3D

[assignments]
string1 = VD1
bank = VD3

[categories]
string1 = solar
bank = Battery
ENV = weather

[datasheet]
string_voltage = 400
nominal_battery_voltage = 48

[diagnosis]
notifications = off
"#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn full_config() {
        let file = write_config(SAMPLE);
        let path = file.path().to_str().unwrap();
        let s = Settings::load(path).unwrap();

        assert_eq!(s.log.as_deref(), Some("/tmp/pvwatch.log"));
        assert_eq!(log_location(path).as_deref(), Some("/tmp/pvwatch.log"));
        assert_eq!(s.reference_device, "INVD");
        assert_eq!(s.serial.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(s.serial.command_timeout, Duration::from_millis(500));
        assert_eq!(s.serial.reconnect_delay, Duration::from_secs(10));
        assert_eq!(s.serial.delay, 5);
        assert_eq!(s.serial.baud, 115200);
        assert_eq!(s.webserver.port, 8080);
        assert_eq!(s.webserver.address, "0.0.0.0");
        assert!(s.postgres.is_none());

        let ids: Vec<&str> = s.schema.entries().iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(ids, vec!["VD1", "ENV", "VD3"]);
        assert_eq!(s.schema.device("ENV").unwrap().fields, vec!["T_amb", "Rssi"]);

        assert_eq!(s.topology.device_category("VD3"), Category::Battery);
        assert_eq!(s.topology.device_category("ENV"), Category::Other);
        assert_eq!(s.topology.assignments().len(), 2);

        assert_relative_eq!(s.thresholds.voltage.pv_max, 480.0);
        assert_relative_eq!(s.thresholds.voltage.battery_min, 42.0);
        assert!(s.diagnosis.enabled);
        assert!(!s.diagnosis.notifications);
    }

    #[test]
    fn explicit_thresholds_win_over_datasheet() {
        let conf = Ini::load_from_str(
            "[thresholds]\nvoltage.pv_min = 120\ncommunication.min_rssi = abc\n\n[datasheet]\nstring_voltage = 400\n",
        )
        .unwrap();
        let s = Settings::from_ini(&conf);
        assert_relative_eq!(s.thresholds.voltage.pv_min, 120.0);
        assert_relative_eq!(s.thresholds.voltage.pv_max, 450.0);
        assert_relative_eq!(s.thresholds.communication.min_rssi, -90.0);
    }

    #[test]
    fn empty_config_gives_defaults() {
        let s = Settings::from_ini(&Ini::new());
        assert!(s.schema.is_empty());
        assert_eq!(s.thresholds, ThresholdSet::default());
        assert_eq!(s.diagnosis, DiagnosisSettings::default());
        assert_eq!(s.serial, SerialSettings::default());
        assert_eq!(s.webserver.port, 8000);
    }

    #[test]
    fn unsupported_baud_falls_back() {
        let s = Settings::from_ini(&Ini::load_from_str("[serial]\nbaud = 12345\n").unwrap());
        assert_eq!(s.serial.baud, DEFAULT_BAUD);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Settings::load("/nonexistent/pvwatch.conf").is_err());
        assert_eq!(log_location("/nonexistent/pvwatch.conf"), None);
    }

    #[test]
    fn complete_postgres_section() {
        let conf = Ini::load_from_str(
            "[postgres]\nhost = db\ndbname = pv\nusername = u\npassword = p\n",
        )
        .unwrap();
        let pg = Settings::from_ini(&conf).postgres.unwrap();
        assert_eq!(pg.host, "db");
        assert_eq!(pg.password, "p");
    }
}
