use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A row from the external `outlets` table. Read-only from this side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Outlet {
    pub id: Option<i64>,
    pub name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub maps_url: Option<String>,
    pub location_category: Option<String>,
    pub source: Option<String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl Outlet {
    /// Builds an outlet from a dynamically shaped result row. Generated
    /// SELECTs may project any column subset, so everything but the name is
    /// optional; an unnamed row is rendered as "N/A" the way the directory
    /// export does.
    pub fn from_row(row: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            row.get(key).and_then(Value::as_str).map(str::to_string)
        };
        Self {
            id: row.get("id").and_then(Value::as_i64),
            name: text("name").unwrap_or_else(|| "N/A".to_string()),
            address: text("address"),
            city: text("city"),
            state: text("state"),
            postal_code: text("postal_code"),
            maps_url: text("maps_url"),
            location_category: text("location_category"),
            source: text("source"),
            fetched_at: text("fetched_at").and_then(|raw| {
                DateTime::parse_from_rfc3339(&raw).ok().map(|ts| ts.with_timezone(&Utc))
            }),
        }
    }

    /// One bullet line per outlet, with a maps line when a URL is present.
    pub fn bullet_line(&self, include_maps: bool) -> String {
        let mut line = format!(
            "\u{2022} {} - {} ({}, {})",
            self.name,
            self.address.as_deref().unwrap_or("N/A"),
            self.city.as_deref().unwrap_or("N/A"),
            self.state.as_deref().unwrap_or("N/A"),
        );
        if include_maps {
            if let Some(url) = &self.maps_url {
                line.push_str(&format!("\n  Map: {url}"));
            }
        }
        line
    }
}
