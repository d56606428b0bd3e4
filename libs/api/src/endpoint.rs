use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Kind of backend an endpoint points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    #[default]
    Sql,
    Http,
}

impl std::str::FromStr for EndpointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sql" => Ok(EndpointKind::Sql),
            "http" => Ok(EndpointKind::Http),
            other => Err(format!("the type \"{other}\" is not one of the recognised values [sql, http]")),
        }
    }
}

/// Connection details for a named backend.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "type", default)]
    pub kind: EndpointKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Expression deciding whether the endpoint is visible to a request.
    #[serde(default)]
    pub condition: Option<String>,
}

// Password is never printed.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("condition", &self.condition)
            .finish()
    }
}

/// Named endpoints visible to one pipeline instance.
///
/// Cloning shares the underlying map: pre-processors register endpoints
/// that the main source later looks up.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    inner: Arc<RwLock<BTreeMap<String, Endpoint>>>,
}

impl Endpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, endpoint: Endpoint) {
        self.inner.write().insert(name.into(), endpoint);
    }

    pub fn get(&self, name: &str) -> Option<Endpoint> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}
