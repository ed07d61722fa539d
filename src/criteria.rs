//! Server-supplied capture policy: which responses are worth capturing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;

use crate::channel::Controller;
use crate::logging;
use crate::protocol::procedures;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRange {
    pub min: u16,
    pub max: u16,
}

/// Wire form of the capture criteria
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureCriteria {
    pub status_codes: Vec<u16>,
    pub status_ranges: Vec<StatusRange>,
    /// Regular expressions matched against the request path
    pub routes: Vec<String>,
}

impl CaptureCriteria {
    pub fn is_empty(&self) -> bool {
        self.status_codes.is_empty() && self.status_ranges.is_empty() && self.routes.is_empty()
    }
}

/// Criteria with route patterns compiled
#[derive(Debug, Default)]
struct Compiled {
    raw: CaptureCriteria,
    routes: Vec<Regex>,
}

impl Compiled {
    fn new(raw: CaptureCriteria) -> Self {
        let routes = raw
            .routes
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    logging::warn(&format!("Skipping invalid route pattern {:?}: {}", pattern, e));
                    None
                }
            })
            .collect();
        Self { raw, routes }
    }

    fn status_matches(&self, status: u16) -> bool {
        self.raw.status_codes.contains(&status)
            || self
                .raw
                .status_ranges
                .iter()
                .any(|r| (r.min..=r.max).contains(&status))
    }

    fn route_matches(&self, path: &str) -> bool {
        self.routes.iter().any(|re| re.is_match(path))
    }

    /// A response is interesting when its status matches, or its route
    /// does. Empty criteria match nothing.
    fn matches(&self, status: u16, path: &str) -> bool {
        self.status_matches(status) || self.route_matches(path)
    }
}

/// Current criteria, replaced wholesale on refresh or push
#[derive(Default)]
pub struct CriteriaStore {
    current: RwLock<Compiled>,
}

impl CriteriaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> CaptureCriteria {
        self.current
            .read()
            .map(|c| c.raw.clone())
            .unwrap_or_default()
    }

    pub fn replace(&self, criteria: CaptureCriteria) {
        if let Ok(mut current) = self.current.write() {
            *current = Compiled::new(criteria);
        }
    }

    /// Apply a pushed or fetched payload
    pub fn apply(&self, payload: Value) -> anyhow::Result<()> {
        let criteria: CaptureCriteria = serde_json::from_value(payload)?;
        logging::info(&format!(
            "Capture criteria updated: {} codes, {} ranges, {} routes",
            criteria.status_codes.len(),
            criteria.status_ranges.len(),
            criteria.routes.len()
        ));
        self.replace(criteria);
        Ok(())
    }

    /// Fetch from the controller. Keeps the previous criteria on failure.
    pub async fn refresh(&self, controller: &dyn Controller) -> anyhow::Result<()> {
        let payload = controller
            .call(procedures::CAPTURE_CRITERIA, Value::Null)
            .await?;
        self.apply(payload)
    }

    pub fn should_capture(&self, status: u16, path: &str) -> bool {
        self.current
            .read()
            .map(|c| c.matches(status, path))
            .unwrap_or(false)
    }
}
