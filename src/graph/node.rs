//! Node identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Anything that can live in a [`Graph`](super::Graph).
pub trait GraphNode {
    /// Returns the node's graph identity.
    fn id(&self) -> String;
}

/// Logical identity of a node: `(type, name, component, environment)`.
///
/// Keys render as `[environment/][component/]type/name`. Dots and whitespace
/// inside segments are replaced with `-`, so a rendered key never contains a
/// `.` and can be used on the left side of an `id.key` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
}

impl NodeKey {
    /// Creates an unscoped key.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            component: None,
            environment: None,
        }
    }

    /// Creates a key scoped by an optional component and environment.
    #[must_use]
    pub fn scoped(
        resource_type: impl Into<String>,
        name: impl Into<String>,
        component: Option<&str>,
        environment: Option<&str>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            component: component.map(str::to_string),
            environment: environment.map(str::to_string),
        }
    }

    /// Resource type tag.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Name, unique within the owning scope.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning component, if any.
    #[must_use]
    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    /// Owning environment, if any.
    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c == '.' || c.is_whitespace() { '-' } else { c })
        .collect()
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(environment) = &self.environment {
            write!(f, "{}/", sanitize(environment))?;
        }
        if let Some(component) = &self.component {
            write!(f, "{}/", sanitize(component))?;
        }
        write!(f, "{}/{}", sanitize(&self.resource_type), sanitize(&self.name))
    }
}
