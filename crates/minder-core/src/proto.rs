//! Wire message types for entity bodies carried on the bus.
//!
//! Envelope payloads are prost-encoded, one message type per entity kind.
//! The structs here are hand-maintained rather than build-generated so the
//! workspace builds without a protobuf toolchain; field tags are stable and
//! must never be reused.

use prost::Message;
use thiserror::Error;

use crate::entities::EntityType;

/// Errors raised when decoding an entity wire body.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// The payload bytes did not decode as the expected message.
    #[error("entity payload decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    /// No decoder exists for the unspecified entity type.
    #[error("cannot decode payload for unspecified entity type")]
    UnspecifiedType,
}

/// A source code repository.
#[derive(Clone, PartialEq, Message)]
pub struct Repository {
    /// Full name, e.g. `testorg/testrepo`.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Owner login.
    #[prost(string, tag = "2")]
    pub owner: String,
    /// Provider-assigned repository id.
    #[prost(uint64, tag = "3")]
    pub repo_id: u64,
    /// Registered webhook id, zero when absent.
    #[prost(uint64, tag = "4")]
    pub hook_id: u64,
    /// Whether the repository is private.
    #[prost(bool, tag = "5")]
    pub is_private: bool,
    /// Whether the repository is a fork.
    #[prost(bool, tag = "6")]
    pub is_fork: bool,
    /// Whether the repository is archived upstream.
    #[prost(bool, tag = "7")]
    pub is_archived: bool,
    /// Default branch name.
    #[prost(string, tag = "8")]
    pub default_branch: String,
    /// Clone URL.
    #[prost(string, tag = "9")]
    pub clone_url: String,
}

/// A build artifact.
#[derive(Clone, PartialEq, Message)]
pub struct Artifact {
    /// Artifact name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Artifact kind, e.g. `container`.
    #[prost(string, tag = "2")]
    pub artifact_type: String,
    /// Upstream visibility.
    #[prost(string, tag = "3")]
    pub visibility: String,
    /// Owner login.
    #[prost(string, tag = "4")]
    pub owner: String,
}

/// A pull request.
#[derive(Clone, PartialEq, Message)]
pub struct PullRequest {
    /// Canonical URL.
    #[prost(string, tag = "1")]
    pub url: String,
    /// Pull request number.
    #[prost(uint64, tag = "2")]
    pub number: u64,
    /// Author login.
    #[prost(string, tag = "3")]
    pub author: String,
    /// Title.
    #[prost(string, tag = "4")]
    pub title: String,
    /// Head commit SHA.
    #[prost(string, tag = "5")]
    pub commit_sha: String,
}

/// A release.
#[derive(Clone, PartialEq, Message)]
pub struct Release {
    /// Release name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Tag the release points at.
    #[prost(string, tag = "2")]
    pub tag: String,
    /// Commit SHA the tag resolves to.
    #[prost(string, tag = "3")]
    pub commit_sha: String,
}

/// A pipeline run.
#[derive(Clone, PartialEq, Message)]
pub struct PipelineRun {
    /// Pipeline name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Provider-assigned run id.
    #[prost(uint64, tag = "2")]
    pub run_id: u64,
    /// Terminal status string.
    #[prost(string, tag = "3")]
    pub status: String,
}

/// A task run within a pipeline.
#[derive(Clone, PartialEq, Message)]
pub struct TaskRun {
    /// Task name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Provider-assigned run id.
    #[prost(uint64, tag = "2")]
    pub run_id: u64,
    /// Terminal status string.
    #[prost(string, tag = "3")]
    pub status: String,
}

/// A build.
#[derive(Clone, PartialEq, Message)]
pub struct Build {
    /// Build name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Provider-assigned build id.
    #[prost(uint64, tag = "2")]
    pub build_id: u64,
    /// Terminal status string.
    #[prost(string, tag = "3")]
    pub status: String,
}

/// A build environment.
#[derive(Clone, PartialEq, Message)]
pub struct BuildEnvironment {
    /// Environment name.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// A decoded entity wire body, one variant per entity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityMessage {
    /// Repository body.
    Repository(Repository),
    /// Artifact body.
    Artifact(Artifact),
    /// Pull request body.
    PullRequest(PullRequest),
    /// Release body.
    Release(Release),
    /// Pipeline run body.
    PipelineRun(PipelineRun),
    /// Task run body.
    TaskRun(TaskRun),
    /// Build body.
    Build(Build),
    /// Build environment body.
    BuildEnvironment(BuildEnvironment),
}

impl EntityMessage {
    /// The entity type this body belongs to.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Repository(_) => EntityType::Repository,
            Self::Artifact(_) => EntityType::Artifact,
            Self::PullRequest(_) => EntityType::PullRequest,
            Self::Release(_) => EntityType::Release,
            Self::PipelineRun(_) => EntityType::PipelineRun,
            Self::TaskRun(_) => EntityType::TaskRun,
            Self::Build(_) => EntityType::Build,
            Self::BuildEnvironment(_) => EntityType::BuildEnvironment,
        }
    }

    /// Encodes the body to wire bytes.
    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        match self {
            Self::Repository(m) => m.encode_to_vec(),
            Self::Artifact(m) => m.encode_to_vec(),
            Self::PullRequest(m) => m.encode_to_vec(),
            Self::Release(m) => m.encode_to_vec(),
            Self::PipelineRun(m) => m.encode_to_vec(),
            Self::TaskRun(m) => m.encode_to_vec(),
            Self::Build(m) => m.encode_to_vec(),
            Self::BuildEnvironment(m) => m.encode_to_vec(),
        }
    }

    /// Decodes wire bytes using the per-type decoder.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::UnspecifiedType`] when `entity_type` is the
    /// unspecified placeholder, or [`WireError::Decode`] on malformed bytes.
    pub fn decode(entity_type: EntityType, bytes: &[u8]) -> Result<Self, WireError> {
        match entity_type {
            EntityType::Unspecified => Err(WireError::UnspecifiedType),
            EntityType::Repository => Ok(Self::Repository(Repository::decode(bytes)?)),
            EntityType::Artifact => Ok(Self::Artifact(Artifact::decode(bytes)?)),
            EntityType::PullRequest => Ok(Self::PullRequest(PullRequest::decode(bytes)?)),
            EntityType::Release => Ok(Self::Release(Release::decode(bytes)?)),
            EntityType::PipelineRun => Ok(Self::PipelineRun(PipelineRun::decode(bytes)?)),
            EntityType::TaskRun => Ok(Self::TaskRun(TaskRun::decode(bytes)?)),
            EntityType::Build => Ok(Self::Build(Build::decode(bytes)?)),
            EntityType::BuildEnvironment => {
                Ok(Self::BuildEnvironment(BuildEnvironment::decode(bytes)?))
            }
        }
    }
}
