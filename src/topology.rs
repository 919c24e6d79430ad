use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Solar,
    Battery,
    Inverter,
    Other,
}

impl Category {
    /// unknown names fall back to `Other`
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "solar" | "pv" => Category::Solar,
            "battery" => Category::Battery,
            "inverter" => Category::Inverter,
            _ => Category::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Solar => "solar",
            Category::Battery => "battery",
            Category::Inverter => "inverter",
            Category::Other => "other",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Other
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logical measurement points, the devices feeding each of them and their categories
#[derive(Clone, Debug, Default)]
pub struct Topology {
    assignments: Vec<(String, Vec<String>)>,
    categories: HashMap<String, Category>,
}

impl Topology {
    pub fn new(
        assignments: Vec<(String, Vec<String>)>,
        categories: HashMap<String, Category>,
    ) -> Self {
        Self {
            assignments,
            categories,
        }
    }

    pub fn assignments(&self) -> &[(String, Vec<String>)] {
        &self.assignments
    }

    pub fn point_category(&self, point_id: &str) -> Category {
        self.categories.get(point_id).copied().unwrap_or_default()
    }

    /// Category used when judging a single device: an entry keyed by the device
    /// itself wins, then the category of the point it is assigned to.
    pub fn device_category(&self, device_id: &str) -> Category {
        if let Some(category) = self.categories.get(device_id) {
            return *category;
        }
        self.assignments
            .iter()
            .find(|(_, devices)| devices.iter().any(|d| d == device_id))
            .map(|(point, _)| self.point_category(point))
            .unwrap_or_default()
    }
}

/// `string1`, `String 2` and the like name a PV string even without a category
pub fn is_string_point(point_id: &str) -> bool {
    point_id.trim().to_ascii_lowercase().starts_with("string")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> Topology {
        let mut categories = HashMap::new();
        categories.insert("string1".to_string(), Category::Solar);
        categories.insert("bank".to_string(), Category::Battery);
        categories.insert("VD9".to_string(), Category::Inverter);
        Topology::new(
            vec![
                ("string1".to_string(), vec!["VD1".to_string(), "ID1".to_string()]),
                ("bank".to_string(), vec!["VD3".to_string()]),
                ("spare".to_string(), vec!["VD9".to_string()]),
            ],
            categories,
        )
    }

    #[test]
    fn category_names() {
        assert_eq!(Category::from_name(" Battery "), Category::Battery);
        assert_eq!(Category::from_name("wind"), Category::Other);
        assert_eq!(Category::Solar.to_string(), "solar");
    }

    #[test]
    fn device_category_resolution() {
        let t = topology();
        assert_eq!(t.device_category("ID1"), Category::Solar);
        assert_eq!(t.device_category("VD3"), Category::Battery);
        assert_eq!(t.device_category("VD9"), Category::Inverter);
        assert_eq!(t.device_category("XX"), Category::Other);
        assert_eq!(t.point_category("spare"), Category::Other);
    }

    #[test]
    fn string_points() {
        assert!(is_string_point("String 2"));
        assert!(!is_string_point("bank"));
    }
}
