use crate::schema::Schema;
use chrono::{Local, NaiveDateTime};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;

pub const FIELD_DELIMITER: char = ',';
pub const NAN_LITERAL: &str = "NaN";

/// A single field slot of a frame
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    NotANumber,
    Opaque(String),
}

impl Value {
    pub fn from_token(token: &str) -> Self {
        let token = token.trim();
        if token.eq_ignore_ascii_case(NAN_LITERAL) {
            return Value::NotANumber;
        }
        match token.parse::<f64>() {
            Ok(v) if v.is_finite() => Value::Number(v),
            _ => Value::Opaque(token.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::NotANumber)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Number(v) => serializer.serialize_f64(*v),
            Value::NotANumber => serializer.serialize_str(NAN_LITERAL),
            Value::Opaque(s) => serializer.serialize_str(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Number(v) => write!(f, "{}", v),
            Value::NotANumber => write!(f, "{}", NAN_LITERAL),
            Value::Opaque(s) => write!(f, "{:?}", s),
        }
    }
}

/// Fields of one device in schema order
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceReading {
    pub device_id: String,
    pub fields: Vec<(String, Value)>,
}

impl DeviceReading {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, v)| v)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(|v| v.as_number())
    }
}

impl Serialize for DeviceReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StructuredReading {
    pub timestamp: String,
    pub devices: Vec<DeviceReading>,
}

impl StructuredReading {
    pub fn device(&self, device_id: &str) -> Option<&DeviceReading> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    /// Timestamp as a point in time, if the controller sent something we understand
    pub fn instant(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.timestamp)
    }
}

impl Serialize for StructuredReading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.devices.len()))?;
        for device in &self.devices {
            map.serialize_entry(&device.device_id, device)?;
        }
        map.end()
    }
}

impl fmt::Display for StructuredReading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "reading @ {}:", self.timestamp)?;
        for device in &self.devices {
            write!(f, "\n  {}:", device.device_id)?;
            for (name, value) in &device.fields {
                write!(f, " {}={}", name, value)?;
            }
        }
        Ok(())
    }
}

/// Result of parsing one line from the controller
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Structured(StructuredReading),
    /// degraded form used while no schema is configured
    Flat { timestamp: String, values: Vec<f64> },
}

impl Frame {
    pub fn timestamp(&self) -> &str {
        match self {
            Frame::Structured(r) => &r.timestamp,
            Frame::Flat { timestamp, .. } => timestamp,
        }
    }

    /// Returns None ("no data") for lines without a single delimiter
    /// or without any usable value.
    pub fn parse(line: &str, schema: &Schema) -> Option<Self> {
        let line = line.trim();
        if !line.contains(FIELD_DELIMITER) {
            return None;
        }
        let tokens: Vec<&str> = line.split(FIELD_DELIMITER).collect();

        //numeric first token means the controller did not stamp the frame
        let (timestamp, values) = match Value::from_token(tokens[0]) {
            Value::Opaque(_) => (tokens[0].trim().to_string(), &tokens[1..]),
            _ => (generation_timestamp(), &tokens[..]),
        };

        if schema.is_empty() {
            let values: Vec<f64> = values
                .iter()
                .filter_map(|t| Value::from_token(t).as_number())
                .collect();
            if values.is_empty() {
                return None;
            }
            return Some(Frame::Flat { timestamp, values });
        }

        let mut tokens = values.iter();
        let mut devices = vec![];
        'schema: for entry in schema.entries() {
            let mut fields = vec![];
            for field in &entry.fields {
                match tokens.next() {
                    Some(token) => fields.push((field.clone(), Value::from_token(token))),
                    None => {
                        if !fields.is_empty() {
                            devices.push(DeviceReading {
                                device_id: entry.device_id.clone(),
                                fields,
                            });
                        }
                        break 'schema;
                    }
                }
            }
            devices.push(DeviceReading {
                device_id: entry.device_id.clone(),
                fields,
            });
        }

        if devices.is_empty() {
            return None;
        }
        Some(Frame::Structured(StructuredReading { timestamp, devices }))
    }
}

pub fn generation_timestamp() -> String {
    Local::now()
        .naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaEntry;
    use proptest::prelude::*;

    fn schema() -> Schema {
        Schema::new(vec![
            SchemaEntry::new("VD1", &["V1D", "I1D"]),
            SchemaEntry::new("ENV", &["T_amb", "Rssi"]),
        ])
    }

    fn structured(frame: Option<Frame>) -> StructuredReading {
        match frame {
            Some(Frame::Structured(r)) => r,
            other => panic!("expected structured frame, got {:?}", other),
        }
    }

    #[test]
    fn line_without_delimiter_is_no_data() {
        assert_eq!(Frame::parse("WAITING", &schema()), None);
        assert_eq!(Frame::parse("230.5", &Schema::default()), None);
    }

    #[test]
    fn caller_timestamp_is_kept() {
        let r = structured(Frame::parse(
            "2025-12-03 02:25:48,230.0,8.5,28.0,-65",
            &schema(),
        ));
        assert_eq!(r.timestamp, "2025-12-03 02:25:48");
        assert_eq!(r.devices.len(), 2);
        assert_eq!(r.device("VD1").unwrap().number("V1D"), Some(230.0));
        assert_eq!(r.device("ENV").unwrap().number("Rssi"), Some(-65.0));
        assert!(r.instant().is_some());
    }

    #[test]
    fn numeric_first_token_gets_generated_timestamp() {
        let r = structured(Frame::parse("230.0,8.5,28.0,-65", &schema()));
        assert!(parse_timestamp(&r.timestamp).is_some());
        assert_eq!(r.device("VD1").unwrap().number("V1D"), Some(230.0));
    }

    #[test]
    fn nan_and_opaque_tokens() {
        let r = structured(Frame::parse("ts,nan,NAN,hello,-65", &schema()));
        let vd1 = r.device("VD1").unwrap();
        assert_eq!(vd1.get("V1D"), Some(&Value::NotANumber));
        assert_eq!(vd1.get("I1D"), Some(&Value::NotANumber));
        assert_eq!(
            r.device("ENV").unwrap().get("T_amb"),
            Some(&Value::Opaque("hello".to_string()))
        );
    }

    #[test]
    fn leftover_tokens_ignored_and_short_frames_truncate() {
        let r = structured(Frame::parse("ts,1,2,3,4,5,6", &schema()));
        assert_eq!(r.devices[1].fields.len(), 2);

        let r = structured(Frame::parse("ts,1,2,3", &schema()));
        assert_eq!(r.devices.len(), 2);
        assert_eq!(r.devices[1].fields, vec![("T_amb".to_string(), Value::Number(3.0))]);

        let r = structured(Frame::parse("ts,1", &schema()));
        assert_eq!(r.devices.len(), 1);
        assert_eq!(r.devices[0].get("I1D"), None);
    }

    #[test]
    fn flat_fallback_drops_malformed_tokens() {
        match Frame::parse("2025-01-01 10:00:00,1.5,abc,NaN,2", &Schema::default()) {
            Some(Frame::Flat { timestamp, values }) => {
                assert_eq!(timestamp, "2025-01-01 10:00:00");
                assert_eq!(values, vec![1.5, 2.0]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(Frame::parse("ts,abc", &Schema::default()), None);
    }

    fn shaped_schema(shape: &[usize]) -> Schema {
        Schema::new(
            shape
                .iter()
                .enumerate()
                .map(|(d, count)| SchemaEntry {
                    device_id: format!("VD{}", d + 1),
                    fields: (0..*count).map(|f| format!("F{}_{}", d + 1, f)).collect(),
                })
                .collect(),
        )
    }

    fn controller_line(values: &[Value]) -> String {
        let tokens: Vec<String> = values
            .iter()
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                _ => NAN_LITERAL.to_string(),
            })
            .collect();
        format!("2025-06-01 12:00:00,{}", tokens.join(","))
    }

    fn slot() -> impl Strategy<Value = Value> {
        prop_oneof![
            3 => (-1.0e6..1.0e6f64).prop_map(Value::Number),
            1 => Just(Value::NotANumber),
        ]
    }

    proptest! {
        #[test]
        fn full_frame_maps_every_value_onto_its_field(
            shape in prop::collection::vec(1usize..5, 1..5),
            pool in prop::collection::vec(slot(), 25),
        ) {
            let schema = shaped_schema(&shape);
            let values = &pool[..schema.field_count()];
            let r = structured(Frame::parse(&controller_line(values), &schema));

            prop_assert_eq!(r.timestamp.as_str(), "2025-06-01 12:00:00");
            prop_assert_eq!(r.devices.len(), shape.len());
            let mut expected = values.iter();
            for (device, entry) in r.devices.iter().zip(schema.entries()) {
                prop_assert_eq!(&device.device_id, &entry.device_id);
                for ((name, value), field) in device.fields.iter().zip(&entry.fields) {
                    prop_assert_eq!(name, field);
                    prop_assert_eq!(Some(value), expected.next());
                }
            }
            prop_assert!(expected.next().is_none());
        }

        #[test]
        fn short_frame_keeps_the_leading_values(
            shape in prop::collection::vec(1usize..5, 1..5),
            pool in prop::collection::vec(slot(), 25),
            cut in 1usize..25,
        ) {
            let schema = shaped_schema(&shape);
            let cut = cut.min(schema.field_count());
            let r = structured(Frame::parse(&controller_line(&pool[..cut]), &schema));

            let parsed: Vec<Value> = r
                .devices
                .iter()
                .flat_map(|d| d.fields.iter().map(|(_, v)| v.clone()))
                .collect();
            prop_assert_eq!(&parsed[..], &pool[..cut]);
            //devices past the cut are absent, never empty
            prop_assert!(r.devices.iter().all(|d| !d.fields.is_empty()));
            let mut seen = 0;
            let touched = shape
                .iter()
                .take_while(|count| {
                    let before = seen;
                    seen += *count;
                    before < cut
                })
                .count();
            prop_assert_eq!(r.devices.len(), touched);
        }
    }

    #[test]
    fn serializes_in_schema_order() {
        let r = structured(Frame::parse("ts,230,NaN,28,-65", &schema()));
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(
            json,
            r#"{"VD1":{"V1D":230.0,"I1D":"NaN"},"ENV":{"T_amb":28.0,"Rssi":-65.0}}"#
        );
    }
}
