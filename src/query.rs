//! Selection queries for the profiling catalog.
//!
//! Builds the JSON search body sent to the catalog: one query per selection
//! expression, scoped to Go runtime profiles, sorted by consumed CPU cores so
//! the hottest workloads come back first.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Sort field ranking candidates by how much CPU the workload burned.
pub const SORT_FIELD_CPU_CORES: &str = "@metrics.core_cpu_cores";

const SORT_ORDER_DESC: &str = "desc";
const GO_RUNTIME_TAG: &str = "runtime:go";
const GO_LANGUAGE_TAG: &str = "language:go";

/// One search request against the catalog.
#[derive(Debug, Clone, Serialize)]
pub struct SelectionQuery {
    pub filter: SearchFilter,
    pub sort: SearchSort,
    /// Maximum number of candidates to retain from this query's results.
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchFilter {
    pub from: ApiTime,
    pub to: ApiTime,
    pub query: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchSort {
    pub order: String,
    pub field: String,
}

/// Timestamp in the catalog's wire format.
///
/// Serializes as UTC RFC 3339 rounded to whole seconds ("2024-05-01T10:30:00Z");
/// parses timestamps with fractional seconds as returned by the API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ApiTime(pub DateTime<Utc>);

impl fmt::Display for ApiTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.round_subsecs(0).format("%Y-%m-%dT%H:%M:%SZ"))
    }
}

impl Serialize for ApiTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ApiTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let parsed = DateTime::parse_from_rfc3339(&s).map_err(serde::de::Error::custom)?;
        Ok(ApiTime(parsed.with_timezone(&Utc)))
    }
}

/// Build one catalog query per selection expression, all sharing the same
/// lookback window ending now.
///
/// Expressions that do not already scope to Go profiles get ` runtime:go`
/// appended, since only Go CPU profiles can feed a PGO build.
pub fn build_queries(window: Duration, limit: usize, terms: &[String]) -> Vec<SelectionQuery> {
    let now = Utc::now();
    let lookback = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
    let from = now
        .checked_sub_signed(lookback)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    terms
        .iter()
        .map(|term| {
            let mut query = term.trim().to_string();
            if !query.contains(GO_LANGUAGE_TAG) && !query.contains(GO_RUNTIME_TAG) {
                query.push(' ');
                query.push_str(GO_RUNTIME_TAG);
            }
            SelectionQuery {
                filter: SearchFilter {
                    from: ApiTime(from),
                    to: ApiTime(now),
                    query,
                },
                sort: SearchSort {
                    order: SORT_ORDER_DESC.to_string(),
                    field: SORT_FIELD_CPU_CORES.to_string(),
                },
                limit,
            }
        })
        .collect()
}
