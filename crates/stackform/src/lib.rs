//! # Stackform
//!
//! Stackform declares cloud infrastructure stacks in Rust. A [`Stack`] is a
//! scope that collects resource declarations, tracks the tokens passed
//! between them and turns the whole thing into a directed acyclic graph of
//! actions.
//!
//! There is no separate provisioning service. Resources implement
//! [`Resource`] directly against the platform API (see [`aws`]) and the
//! stack decides whether each one must be created, updated, loaded from
//! state or destroyed.
//!
//! ## Concepts
//!
//! - **Definition**: the desired configuration of a resource, written in
//!   code. Any type implementing [`Resource`].
//! - **Output**: what the platform reports back once the resource exists,
//!   eg. a generated name or an ARN.
//! - **Token**: a [`Remote`] value mapped from another resource's output.
//!   Putting a token into a definition adds a dependency edge.
//! - **Construct**: the handle returned by [`Stack::resource`]. Use it to
//!   derive tokens for downstream definitions.
//! - **Template**: the synthesized declaration of a stack, see
//!   [`Stack::synth`].
//!
//! ## Workflow
//!
//! ```ignore
//! let mut stack = Stack::new("demo", "state", provider);
//! let bucket = stack.resource("Bucket", my_bucket)?;
//! let _worker = stack.resource("Worker", Worker { bucket: bucket.remote(|b| b.name.clone()) })?;
//! let plan = stack.plan()?;
//! println!("{plan}");
//! stack.apply(plan).await?;
//! ```
//!
//! ## Error Handling
//!
//! All stack operations return [`Error`]. Errors produced by resources
//! during apply are boxed into the `Create`, `Update` and `Destroy`
//! variants along with the name of the construct that failed.
use std::future::Future;

extern crate self as form;

pub use stackform_derive::HasDependencies;

pub mod aws;
mod has_dependencies_impl;
pub mod remote;
mod stack;
pub mod template;
#[cfg(test)]
mod test;
pub mod utils;

pub use remote::Remote;
pub use stack::{Construct, Plan, PlannedAction, Stack};
pub use template::{Template, TemplateResource};

/// Marker trait for userland errors.
pub trait UserError: core::fmt::Display + core::fmt::Debug + 'static {}
impl<T: core::fmt::Display + core::fmt::Debug + 'static> UserError for T {}

/// Top-level error enum that encompasses all errors.
#[derive(snafu::Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("{error}:\n{}",
                error.chain()
                    .map(|e| format!("{e}"))
                    .collect::<Vec<_>>()
                    .join("\n -> ")))]
    Form { error: anyhow::Error },

    #[snafu(display("Could not read state file '{path:?}': {source}"))]
    StateFileRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not delete state file '{path:?}': {source}"))]
    StateFileDelete {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not scan state directory '{path:?}': {source}"))]
    ScanStateDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not create {path:?}: {source}"))]
    CreateFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not write {path:?}: {source}"))]
    WriteFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not serialize '{name}': {source}"))]
    Serialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not deserialize '{name}': {source}"))]
    Deserialize {
        name: String,
        source: serde_json::Error,
    },

    #[snafu(display("Could not build schedule: {msg}"))]
    Schedule { msg: String },

    #[snafu(display("Could not save the apply graph: {source}"))]
    Dot { source: dagga::dot::DotError },

    #[snafu(display(
        "Could not build apply graph because of a missing construct name for '{missing}'"
    ))]
    MissingName { missing: usize },

    #[snafu(display("Token of type {ty:?} is unresolved, it depends on '{depends_on}'"))]
    RemoteUnresolved {
        ty: &'static str,
        depends_on: String,
    },

    #[snafu(display("There is no construct named '{name}' in this stack"))]
    MissingResource { name: String },

    #[snafu(display("There is already a construct named '{id}' in this stack"))]
    DuplicateId { id: String },

    #[snafu(display("Missing state file for '{id}'"))]
    MissingStateFile { id: String },

    #[snafu(display("Missing remote value of '{name}'"))]
    MissingRemote { name: String },

    #[snafu(display("Construct '{id}' was declared with a different output type"))]
    Downcast { id: String },

    #[snafu(display("Error during '{name}' creation: {error}"))]
    Create {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' read and import: {error}"))]
    Import {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' update: {error}"))]
    Update {
        name: String,
        error: Box<dyn UserError>,
    },

    #[snafu(display("Error during '{name}' destruction: {error}"))]
    Destroy {
        name: String,
        error: Box<dyn UserError>,
    },
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Form { error }
    }
}

impl From<dagga::dot::DotError> for Error {
    fn from(source: dagga::dot::DotError) -> Self {
        Self::Dot { source }
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// IaC resources.
///
/// A resource definition is the desired state of something that lives on a
/// platform (ie AWS). Implementors describe how to create, read, update and
/// delete it through the platform's API.
#[allow(unreachable_code)]
pub trait Resource:
    core::fmt::Debug
    + Clone
    + PartialEq
    + HasDependencies
    + serde::Serialize
    + serde::de::DeserializeOwned
    + 'static
{
    /// Type of the platform/resource provider.
    ///
    /// For example [`aws::Aws`] in the case of amazon web services.
    type Provider;

    /// Errors that may occur interacting with the provider.
    type Error: UserError;

    /// What the platform reports back about the resource once it exists.
    ///
    /// Downstream definitions read these values through [`Remote`] tokens.
    type Output: core::fmt::Debug
        + Clone
        + PartialEq
        + serde::Serialize
        + serde::de::DeserializeOwned
        + 'static;

    /// The kind of resource, as shown in a synthesized [`Template`].
    ///
    /// Defaults to the Rust type name.
    fn kind() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Creates the resource on the platform.
    ///
    /// ## Note
    /// The CRUD methods are `unimplemented!` by default so a resource only
    /// needs to provide what it uses. Calling a missing one panics.
    fn create(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::create is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Reads the current state of the resource from the platform.
    ///
    /// Used by [`Stack::import`] to adopt a resource that already exists.
    fn read(
        &self,
        _provider: &Self::Provider,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::read is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Updates the resource in place, given the previously applied
    /// definition and output.
    fn update(
        &self,
        _provider: &Self::Provider,
        _previous_local: &Self,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> {
        unimplemented!(
            "Resource::update is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }

    /// Deletes the resource from the platform.
    fn delete(
        &self,
        _provider: &Self::Provider,
        _previous_remote: &Self::Output,
    ) -> impl Future<Output = Result<(), Self::Error>> {
        unimplemented!(
            "Resource::delete is unimplemented for {}",
            std::any::type_name::<Self>()
        ) as Box<dyn Future<Output = Result<_, _>> + Unpin>
    }
}

/// Ids of the constructs a definition depends on.
#[derive(Clone, Default, Debug, PartialEq)]
pub struct Dependencies {
    inner: Vec<String>,
}

impl IntoIterator for Dependencies {
    type Item = String;

    type IntoIter = <Vec<String> as IntoIterator>::IntoIter;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl core::fmt::Display for Dependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.join(", "))
    }
}

impl Dependencies {
    pub fn new(id: impl Into<String>) -> Self {
        Dependencies {
            inner: vec![id.into()],
        }
    }

    /// Append `other`, skipping ids that are already present.
    pub fn merge(mut self, other: Self) -> Self {
        for id in other.inner {
            if !self.inner.contains(&id) {
                self.inner.push(id);
            }
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.iter().any(|dep| dep == id)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.inner
    }
}

/// Tracks dependencies between resources.
///
/// This trait can be derived, and has a default implementation that
/// reports zero dependencies.
pub trait HasDependencies {
    fn dependencies(&self) -> Dependencies {
        Dependencies::default()
    }
}

/// What applying a plan will do to a construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Load,
    Create,
    /// Adopt an existing resource, see [`Stack::import`].
    Read,
    Update,
    Destroy,
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Action::Load => "load",
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Destroy => "destroy",
        })
    }
}
