//! Permission value object - the hybrid three-level permission format.
//!
//! Canonical form uses `.` as delimiter:
//! `{resource}.{action}` (base), `{resource}.{action}.{category}` or
//! `{resource}.{action}.{field}`. Legacy `:`-delimited input is accepted only
//! through [`Permission::from_external`] and normalized immediately.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::capability::{CapabilityGraph, Category};

/// A parsed, validated permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    /// Base-level access to a resource action, no field scope.
    Base { resource: String, action: String },
    /// Access to every field of a sensitivity category.
    Category {
        resource: String,
        action: String,
        category: Category,
    },
    /// Wildcard access to all fields, classified or not.
    Wildcard { resource: String, action: String },
    /// Access to one named field.
    Field {
        resource: String,
        action: String,
        field: String,
    },
}

impl Permission {
    /// Parse a canonical `.`-delimited permission string.
    pub fn parse(raw: &str) -> Result<Self, PermissionParseError> {
        let segments: Vec<&str> = raw.split('.').collect();
        match segments.as_slice() {
            [resource, action] => Ok(Permission::Base {
                resource: valid_segment(resource)?,
                action: valid_segment(action)?,
            }),
            [resource, action, scope] => {
                let resource = valid_segment(resource)?;
                let action = valid_segment(action)?;
                if *scope == "wildcard" {
                    Ok(Permission::Wildcard { resource, action })
                } else if let Some(category) = Category::from_label(scope) {
                    Ok(Permission::Category {
                        resource,
                        action,
                        category,
                    })
                } else {
                    Ok(Permission::Field {
                        resource,
                        action,
                        field: valid_segment(scope)?,
                    })
                }
            }
            _ => Err(PermissionParseError::WrongArity(raw.to_string())),
        }
    }

    /// Parse a permission arriving from an external surface, translating the
    /// legacy `:` delimiter before canonical parsing. Mixed delimiters are
    /// rejected.
    pub fn from_external(raw: &str) -> Result<Self, PermissionParseError> {
        if raw.contains(':') && raw.contains('.') {
            return Err(PermissionParseError::MixedDelimiters(raw.to_string()));
        }
        let canonical = raw.replace(':', ".");
        Self::parse(&canonical)
    }

    pub fn resource(&self) -> &str {
        match self {
            Permission::Base { resource, .. }
            | Permission::Category { resource, .. }
            | Permission::Wildcard { resource, .. }
            | Permission::Field { resource, .. } => resource,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Permission::Base { action, .. }
            | Permission::Category { action, .. }
            | Permission::Wildcard { action, .. }
            | Permission::Field { action, .. } => action,
        }
    }

    /// Whether a held permission satisfies a required one.
    ///
    /// A field-level requirement is satisfied by the exact field permission,
    /// by a category permission covering that field (resolved through the
    /// graph), by wildcard, or by base when the required field is
    /// base-classified. Coarser requirements need the matching coarse string.
    pub fn covers(&self, required: &Permission, graph: Option<&CapabilityGraph>) -> bool {
        if self.resource() != required.resource() || self.action() != required.action() {
            return false;
        }
        match (self, required) {
            (a, b) if a == b => true,
            (Permission::Wildcard { .. }, _) => true,
            (Permission::Category { category, .. }, Permission::Field { resource, field, .. }) => {
                match graph {
                    Some(g) => g
                        .field_category(resource, field)
                        .map(|c| c == *category)
                        .unwrap_or(false),
                    None => false,
                }
            }
            (Permission::Base { .. }, Permission::Field { resource, field, .. }) => match graph {
                Some(g) => g
                    .field_category(resource, field)
                    .map(|c| c == Category::Base)
                    .unwrap_or(false),
                None => false,
            },
            // Any grant implies base reachability.
            (Permission::Category { .. }, Permission::Base { .. }) => true,
            (Permission::Field { .. }, Permission::Base { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Base { resource, action } => write!(f, "{}.{}", resource, action),
            Permission::Category {
                resource,
                action,
                category,
            } => write!(f, "{}.{}.{}", resource, action, category.label()),
            Permission::Wildcard { resource, action } => {
                write!(f, "{}.{}.wildcard", resource, action)
            }
            Permission::Field {
                resource,
                action,
                field,
            } => write!(f, "{}.{}.{}", resource, action, field),
        }
    }
}

impl Serialize for Permission {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Permission::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermissionParseError {
    #[error("permission must have 2 or 3 segments: {0}")]
    WrongArity(String),
    #[error("permission segment is empty or contains invalid characters: {0}")]
    BadSegment(String),
    #[error("permission mixes ':' and '.' delimiters: {0}")]
    MixedDelimiters(String),
}

fn valid_segment(segment: &str) -> Result<String, PermissionParseError> {
    let ok = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(segment.to_string())
    } else {
        Err(PermissionParseError::BadSegment(segment.to_string()))
    }
}
