//! Entity identity model for the supply-chain graph.
//!
//! An [`Entity`] is a tracked object (repository, artifact, pull request,
//! ...) uniquely identified by `(project, provider, type, name)`.
//! [`EntityWithProperties`] pairs that identity with the cached property
//! snapshot the pipeline passes around.

pub mod properties;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use properties::{Properties, Property, PropertyError, PropertyValue};

/// Errors raised at entity model boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EntityError {
    /// An entity type string or tag was not recognized.
    #[error("invalid entity type: {0:?}")]
    InvalidEntityType(String),

    /// The unspecified entity type crossed an API boundary.
    #[error("entity type must be specified")]
    UnspecifiedEntityType,

    /// A role string was not recognized.
    #[error("invalid role: {0:?}")]
    InvalidRole(String),
}

/// The kind of a tracked entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// No type; invalid at boundaries, valid only as a selector wildcard.
    #[default]
    Unspecified,
    /// A source code repository.
    Repository,
    /// A build artifact (container image, package, ...).
    Artifact,
    /// A pull request.
    PullRequest,
    /// A release.
    Release,
    /// A pipeline run.
    PipelineRun,
    /// A task run within a pipeline.
    TaskRun,
    /// A build.
    Build,
    /// A build environment.
    BuildEnvironment,
}

impl EntityType {
    /// All concrete (non-unspecified) entity types.
    pub const ALL: [Self; 8] = [
        Self::Repository,
        Self::Artifact,
        Self::PullRequest,
        Self::Release,
        Self::PipelineRun,
        Self::TaskRun,
        Self::Build,
        Self::BuildEnvironment,
    ];

    /// Canonical string form used in bus metadata and selectors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Repository => "repository",
            Self::Artifact => "artifact",
            Self::PullRequest => "pull_request",
            Self::Release => "release",
            Self::PipelineRun => "pipeline_run",
            Self::TaskRun => "task_run",
            Self::Build => "build",
            Self::BuildEnvironment => "build_environment",
        }
    }

    /// Numeric wire tag used in `HandleEntityAndDo` payloads.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Unspecified => 0,
            Self::Repository => 1,
            Self::Artifact => 2,
            Self::PullRequest => 3,
            Self::Release => 4,
            Self::PipelineRun => 5,
            Self::TaskRun => 6,
            Self::Build => 7,
            Self::BuildEnvironment => 8,
        }
    }

    /// Decodes a numeric wire tag.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::InvalidEntityType`] for unknown tags.
    pub fn from_i32(tag: i32) -> Result<Self, EntityError> {
        match tag {
            0 => Ok(Self::Unspecified),
            1 => Ok(Self::Repository),
            2 => Ok(Self::Artifact),
            3 => Ok(Self::PullRequest),
            4 => Ok(Self::Release),
            5 => Ok(Self::PipelineRun),
            6 => Ok(Self::TaskRun),
            7 => Ok(Self::Build),
            8 => Ok(Self::BuildEnvironment),
            other => Err(EntityError::InvalidEntityType(other.to_string())),
        }
    }

    /// True for the unspecified placeholder.
    #[must_use]
    pub fn is_unspecified(self) -> bool {
        self == Self::Unspecified
    }

    /// Rejects the unspecified placeholder at an API boundary.
    ///
    /// # Errors
    ///
    /// Returns [`EntityError::UnspecifiedEntityType`] for
    /// [`EntityType::Unspecified`].
    pub fn require_specified(self) -> Result<Self, EntityError> {
        if self.is_unspecified() {
            return Err(EntityError::UnspecifiedEntityType);
        }
        Ok(self)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unspecified" => Ok(Self::Unspecified),
            "repository" => Ok(Self::Repository),
            "artifact" => Ok(Self::Artifact),
            "pull_request" => Ok(Self::PullRequest),
            "release" => Ok(Self::Release),
            "pipeline_run" => Ok(Self::PipelineRun),
            "task_run" => Ok(Self::TaskRun),
            "build" => Ok(Self::Build),
            "build_environment" => Ok(Self::BuildEnvironment),
            other => Err(EntityError::InvalidEntityType(other.to_owned())),
        }
    }
}

/// A tracked entity's persistent identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable internal identifier.
    pub id: Uuid,
    /// The entity kind.
    pub entity_type: EntityType,
    /// Name unique within `(project, provider, type)`.
    pub name: String,
    /// Owning project.
    pub project_id: Uuid,
    /// Provider that tracks this entity upstream.
    pub provider_id: Uuid,
    /// The entity this one was derived from, if any (child -> parent).
    pub originated_from: Option<Uuid>,
}

/// An entity identity together with its property snapshot.
///
/// Snapshots are borrowed views valid within a single handler invocation;
/// mutation happens only through the property service.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWithProperties {
    /// The identity.
    pub entity: Entity,
    /// The cached properties.
    pub properties: Properties,
}

impl EntityWithProperties {
    /// Pairs an entity with a property snapshot.
    #[must_use]
    pub fn new(entity: Entity, properties: Properties) -> Self {
        Self { entity, properties }
    }

    /// Replaces the property snapshot in place.
    pub fn update_properties(&mut self, properties: Properties) {
        self.properties = properties;
    }

    /// The entity's name, preferring the `name` property over the identity
    /// row (legacy rows may lack the property).
    #[must_use]
    pub fn name(&self) -> String {
        match self.properties.get(properties::PROP_NAME) {
            Some(prop) => prop.get_string(),
            None => self.entity.name.clone(),
        }
    }
}

/// Subject role carried on entity lifecycle call contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full administrative access.
    Admin,
    /// Read/write access to entities and profiles.
    Editor,
    /// Read-only access.
    Viewer,
    /// May author profiles but not manage entities.
    PolicyWriter,
    /// May manage authorization grants.
    PermissionsManager,
}

impl Role {
    /// Canonical string form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
            Self::PolicyWriter => "policy_writer",
            Self::PermissionsManager => "permissions_manager",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            "policy_writer" => Ok(Self::PolicyWriter),
            "permissions_manager" => Ok(Self::PermissionsManager),
            other => Err(EntityError::InvalidRole(other.to_owned())),
        }
    }
}
