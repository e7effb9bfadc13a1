use crate::unit::Unit;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Server,
    Client,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitKind::Server => write!(f, "server"),
            UnitKind::Client => write!(f, "client"),
        }
    }
}

/// Name suffixes that mark a unit as server-side or client-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    pub server_suffix: String,
    pub client_suffix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            server_suffix: "Service".to_string(),
            client_suffix: "Controller".to_string(),
        }
    }
}

impl NamingConvention {
    /// The kind `name` belongs to, if any. A bare suffix is not a unit name.
    pub fn kind_of(&self, name: &str) -> Option<UnitKind> {
        let matches = |suffix: &str| name.len() > suffix.len() && name.ends_with(suffix);
        if matches(&self.server_suffix) {
            Some(UnitKind::Server)
        } else if matches(&self.client_suffix) {
            Some(UnitKind::Client)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("two {kind} units are named {name}")]
    Collision { kind: UnitKind, name: String },
}

/// Candidate units in declaration order.
#[derive(Default)]
pub struct UnitRegistry {
    convention: NamingConvention,
    candidates: Vec<Arc<dyn Unit>>,
}

impl UnitRegistry {
    pub fn new(convention: NamingConvention) -> Self {
        Self {
            convention,
            candidates: Vec::new(),
        }
    }

    pub fn convention(&self) -> &NamingConvention {
        &self.convention
    }

    pub fn declare(&mut self, unit: Arc<dyn Unit>) -> &mut Self {
        debug!("Declared unit candidate {}", unit.name());
        self.candidates.push(unit);
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Units of `kind` sorted by ascending priority, ties in declaration order.
    pub fn discover(&self, kind: UnitKind) -> Result<Vec<Arc<dyn Unit>>, RegistryError> {
        let mut seen = HashSet::new();
        let mut units = Vec::new();

        for unit in &self.candidates {
            match self.convention.kind_of(unit.name()) {
                Some(found) if found == kind => {
                    if !seen.insert(unit.name().to_string()) {
                        return Err(RegistryError::Collision {
                            kind,
                            name: unit.name().to_string(),
                        });
                    }
                    units.push(unit.clone());
                }
                Some(_) => {}
                None => debug!(
                    "Ignoring {}: name matches neither *{} nor *{}",
                    unit.name(),
                    self.convention.server_suffix,
                    self.convention.client_suffix
                ),
            }
        }

        // `sort_by_key` is stable, so equal priorities keep declaration order.
        units.sort_by_key(|unit| unit.priority());

        info!(
            "Discovered {} {} unit(s): [{}]",
            units.len(),
            kind,
            units.iter().map(|u| u.name()).collect::<Vec<_>>().join(", ")
        );
        Ok(units)
    }
}
