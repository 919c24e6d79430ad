use std::fmt;

/// One measurement board and the ordered list of fields it reports per frame
#[derive(Clone, Debug, PartialEq)]
pub struct SchemaEntry {
    pub device_id: String,
    pub fields: Vec<String>,
}

impl SchemaEntry {
    pub fn new(device_id: &str, fields: &[&str]) -> Self {
        Self {
            device_id: device_id.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Parses a `VD1,V1D,I1D` style definition (device id followed by its fields)
    pub fn from_definition(device_id: &str, fields: &str) -> Option<Self> {
        let device_id = device_id.trim();
        if device_id.is_empty() {
            return None;
        }
        let fields: Vec<String> = fields
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            return None;
        }
        Some(Self {
            device_id: device_id.to_string(),
            fields,
        })
    }
}

impl fmt::Display for SchemaEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{}", self.device_id, self.fields.join(","))
    }
}

/// Positional map from a flat frame onto device fields.
/// Replaced wholesale on reconfiguration, never edited in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    entries: Vec<SchemaEntry>,
}

impl Schema {
    pub fn new(entries: Vec<SchemaEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn device(&self, device_id: &str) -> Option<&SchemaEntry> {
        self.entries.iter().find(|e| e.device_id == device_id)
    }

    /// total number of values a complete frame carries
    pub fn field_count(&self) -> usize {
        self.entries.iter().map(|e| e.fields.len()).sum()
    }

    /// Lines understood by the controller firmware when pushing a new layout
    pub fn to_config_lines(&self, delay_secs: u32) -> Vec<String> {
        let mut lines = vec![format!("CONFIG:DELAY={}", delay_secs)];
        for entry in &self.entries {
            lines.push(format!("CONFIG:{}", entry));
        }
        lines.push("CONFIG:END".to_string());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_skips_blank_fields() {
        let entry = SchemaEntry::from_definition(" VD1 ", "V1D, I1D,,").unwrap();
        assert_eq!(entry, SchemaEntry::new("VD1", &["V1D", "I1D"]));
        assert!(SchemaEntry::from_definition("VD1", " , ").is_none());
        assert!(SchemaEntry::from_definition("", "V").is_none());
    }

    #[test]
    fn counts_and_lookup() {
        let schema = Schema::new(vec![
            SchemaEntry::new("VD1", &["V1D", "I1D"]),
            SchemaEntry::new("ENV", &["T_amb", "Hum", "Rssi"]),
        ]);
        assert_eq!(schema.field_count(), 5);
        assert_eq!(schema.device("ENV").map(|e| e.fields.len()), Some(3));
        assert!(schema.device("VD9").is_none());
        assert!(Schema::default().is_empty());
    }

    #[test]
    fn config_lines_are_framed() {
        let schema = Schema::new(vec![SchemaEntry::new("VD1", &["V1D", "I1D"])]);
        assert_eq!(
            schema.to_config_lines(8),
            vec!["CONFIG:DELAY=8", "CONFIG:VD1,V1D,I1D", "CONFIG:END"]
        );
    }
}
