//! Synthesized stack declarations.
//!
//! A [`Template`] is a plain, serializable snapshot of everything declared
//! in a stack. It is what `synth` prints and what tests assert against.
use snafu::ResultExt;

use crate::{Action, Error, SerializeSnafu};

/// One declared construct.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TemplateResource {
    pub id: String,
    pub kind: String,
    pub action: Action,
    /// The serialized definition. Tokens appear as
    /// `{"token": "<id>", "value": ...}`.
    pub properties: serde_json::Value,
    pub depends_on: Vec<String>,
}

impl TemplateResource {
    /// Look up a property by JSON pointer, eg. `"/partition_key/name"`.
    pub fn property(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.properties.pointer(pointer)
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Template {
    pub stack: String,
    /// Constructs in declaration order.
    pub resources: Vec<TemplateResource>,
}

impl Template {
    pub fn resource(&self, id: &str) -> Option<&TemplateResource> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn resources_of_kind<'a>(
        &'a self,
        kind: &'a str,
    ) -> impl Iterator<Item = &'a TemplateResource> + 'a {
        self.resources.iter().filter(move |r| r.kind == kind)
    }

    pub fn count_of_kind(&self, kind: &str) -> usize {
        self.resources_of_kind(kind).count()
    }

    pub fn to_json_pretty(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self).context(SerializeSnafu {
            name: format!("template of stack '{}'", self.stack),
        })
    }
}

impl core::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "stack '{}':", self.stack)?;
        for resource in &self.resources {
            write!(f, "  {} [{}]", resource.id, resource.kind)?;
            if !resource.depends_on.is_empty() {
                write!(f, " <- {}", resource.depends_on.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
