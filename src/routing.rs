//! MT route table: ordered routes with filters selecting a connector.
//!
//! Routes are evaluated in descending priority. A route matches when all of
//! its filters pass and its target connector is currently routable (status
//! string starting with "BOUND", as pushed by the connector-status feed).
//! smartrr routes spread load over an ordered candidate list with a
//! per-route cursor.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::config::{FilterConfig, GatewayConfig, RouteConfig};
use crate::pipeline::MtEvent;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("filter '{name}': invalid regex: {source}")]
    BadRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("filter '{name}' ({kind}) is missing its '{field}' parameter")]
    MissingParameter {
        name: String,
        kind: String,
        field: &'static str,
    },

    #[error("route {priority}: unknown type '{kind}'")]
    UnknownRouteKind { priority: u32, kind: String },

    #[error("route {priority}: no connector target")]
    MissingTarget { priority: u32 },
}

/// A single route filter. New kinds map to additional variants.
#[derive(Debug)]
pub enum RouteFilter {
    /// Always true
    Transparent,
    /// True iff the event originated on the named connector
    Connector(String),
    /// True iff the regex matches the event's destination (`to`)
    SourceAddr(Regex),
    /// True iff the regex matches the event's originator (`from`)
    DestAddr(Regex),
    /// True iff the regex matches the event's message text
    ShortMessage(Regex),
    /// True iff the tag is present on the event
    Tag(i64),
}

impl RouteFilter {
    pub fn from_config(name: &str, config: &FilterConfig) -> Result<Self, RoutingError> {
        let regex = |field: &'static str| -> Result<Regex, RoutingError> {
            let pattern =
                config
                    .regex
                    .as_deref()
                    .ok_or_else(|| RoutingError::MissingParameter {
                        name: name.to_string(),
                        kind: config.kind.clone(),
                        field,
                    })?;
            Regex::new(pattern).map_err(|source| RoutingError::BadRegex {
                name: name.to_string(),
                source,
            })
        };

        match config.kind.as_str() {
            "connector" => Ok(RouteFilter::Connector(config.connector.clone().ok_or_else(
                || RoutingError::MissingParameter {
                    name: name.to_string(),
                    kind: config.kind.clone(),
                    field: "connector",
                },
            )?)),
            "sourceaddr" => Ok(RouteFilter::SourceAddr(regex("regex")?)),
            "destaddr" => Ok(RouteFilter::DestAddr(regex("regex")?)),
            "shortmessage" => Ok(RouteFilter::ShortMessage(regex("regex")?)),
            "tag" => Ok(RouteFilter::Tag(config.tag.ok_or_else(|| {
                RoutingError::MissingParameter {
                    name: name.to_string(),
                    kind: config.kind.clone(),
                    field: "tag",
                }
            })?)),
            // Unknown kinds degrade to transparent, like the reference config loader
            _ => Ok(RouteFilter::Transparent),
        }
    }

    /// Anchored match, like the reference implementation's `re.match`
    fn matches_start(regex: &Regex, value: &str) -> bool {
        regex.find(value).is_some_and(|m| m.start() == 0)
    }

    pub fn evaluate(&self, event: &MtEvent) -> bool {
        match self {
            RouteFilter::Transparent => true,
            RouteFilter::Connector(name) => {
                event.origin_connector.as_deref() == Some(name.as_str())
            }
            RouteFilter::SourceAddr(regex) => Self::matches_start(regex, &event.to),
            RouteFilter::DestAddr(regex) => {
                Self::matches_start(regex, event.from.as_deref().unwrap_or(""))
            }
            RouteFilter::ShortMessage(regex) => Self::matches_start(regex, &event.msg),
            RouteFilter::Tag(tag) => event.tags.contains(tag),
        }
    }
}

enum RouteKind {
    /// Single target; "default" routes are static routes with no filters
    Static { connector: String },
    /// Ordered candidate list with a rotating cursor
    SmartRoundRobin {
        connectors: Vec<String>,
        cursor: AtomicUsize,
    },
}

struct Route {
    priority: u32,
    kind: RouteKind,
    // Filters are shared; several routes may reference the same one
    filters: Vec<Arc<RouteFilter>>,
}

impl Route {
    fn filters_pass(&self, event: &MtEvent) -> bool {
        // Short-circuits on the first failing filter
        self.filters.iter().all(|f| f.evaluate(event))
    }
}

/// The MT route table. Connector statuses are pushed in periodically by the
/// status feed and may lag reality; a route that picks a just-died connector
/// results in a failed submit downstream, not an error here.
pub struct RouteTable {
    routes: Vec<Route>,
    /// Connectors that exist in the gateway config
    known_connectors: HashSet<String>,
    statuses: RwLock<HashMap<String, String>>,
}

impl RouteTable {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, RoutingError> {
        let mut filters: HashMap<&str, Arc<RouteFilter>> = HashMap::new();
        for (name, filter_config) in &config.filters {
            filters.insert(name, Arc::new(RouteFilter::from_config(name, filter_config)?));
        }

        let mut routes = Vec::new();
        for (&priority, route_config) in &config.mt_routes {
            routes.push(build_route(priority, route_config, &filters)?);
        }

        // Descending priority; BTreeMap iteration gave us ascending
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self {
            routes,
            known_connectors: config.connectors.keys().cloned().collect(),
            statuses: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the connector status map (the status feed's push).
    pub fn update_connector_status(&self, statuses: HashMap<String, String>) {
        *self.statuses.write().expect("status lock") = statuses;
    }

    fn routable(&self, connector: &str) -> bool {
        if !self.known_connectors.contains(connector) {
            return false;
        }
        self.statuses
            .read()
            .expect("status lock")
            .get(connector)
            .is_some_and(|status| status.starts_with("BOUND"))
    }

    /// Evaluate the table for an event, highest priority first. Returns the
    /// selected connector name.
    pub fn evaluate(&self, event: &MtEvent) -> Option<String> {
        for route in &self.routes {
            if !route.filters_pass(event) {
                continue;
            }

            match &route.kind {
                RouteKind::Static { connector } => {
                    if self.routable(connector) {
                        return Some(connector.clone());
                    }
                    // Target down: fall through to the next route
                }
                RouteKind::SmartRoundRobin { connectors, cursor } => {
                    // One full cycle; the cursor advances on every evaluation
                    // to spread load even across misses
                    for _ in 0..connectors.len() {
                        let idx = cursor.fetch_add(1, Ordering::Relaxed) % connectors.len();
                        let candidate = &connectors[idx];
                        if self.routable(candidate) {
                            return Some(candidate.clone());
                        }
                    }
                }
            }
        }
        None
    }

    /// Route priorities in evaluation order, for inspection
    pub fn priorities(&self) -> Vec<u32> {
        self.routes.iter().map(|r| r.priority).collect()
    }
}

fn build_route(
    priority: u32,
    config: &RouteConfig,
    filters: &HashMap<&str, Arc<RouteFilter>>,
) -> Result<Route, RoutingError> {
    // Filters referenced by name; missing references are skipped like the
    // reference loader (the filter section may not have parsed)
    let mut route_filters = Vec::new();
    for name in &config.filters {
        if let Some(filter) = filters.get(name.as_str()) {
            route_filters.push(Arc::clone(filter));
        } else {
            tracing::warn!(route = priority, filter = %name, "route references unknown filter");
        }
    }

    let kind = match config.kind.as_str() {
        "static" | "default" => RouteKind::Static {
            connector: config
                .connector
                .clone()
                .ok_or(RoutingError::MissingTarget { priority })?,
        },
        "smartrr" => {
            if config.connectors.is_empty() {
                return Err(RoutingError::MissingTarget { priority });
            }
            RouteKind::SmartRoundRobin {
                connectors: config.connectors.clone(),
                cursor: AtomicUsize::new(0),
            }
        }
        other => {
            return Err(RoutingError::UnknownRouteKind {
                priority,
                kind: other.to_string(),
            });
        }
    };

    Ok(Route {
        priority,
        kind,
        filters: route_filters,
    })
}
