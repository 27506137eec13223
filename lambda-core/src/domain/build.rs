//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::artifact::ImageRef;
use crate::domain::error::{ErrorKind, TransitionError, ValidationError};

/// Maximum length of a tenant or parser identifier
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// `(tenantId, parserId)`, the unit of build mutual exclusion
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildKey {
    pub tenant_id: String,
    pub parser_id: String,
}

impl BuildKey {
    /// Validates both identifiers and builds the key
    pub fn parse(tenant_id: &str, parser_id: &str) -> Result<Self, ValidationError> {
        validate_identifier("tenantId", tenant_id)?;
        validate_identifier("parserId", parser_id)?;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            parser_id: parser_id.to_string(),
        })
    }

    /// Object key of the uploaded parser source
    pub fn source_key(&self) -> String {
        format!("{}/{}.js", self.tenant_id, self.parser_id)
    }

    /// Object key of the packaged source archive
    pub fn archive_key(&self) -> String {
        format!("{}/{}.tar.gz", self.tenant_id, self.parser_id)
    }

    /// Image repository path below the registry prefix
    ///
    /// One path component per identifier, so distinct keys never share a
    /// repository.
    pub fn repository_name(&self) -> String {
        format!("{}/{}", self.tenant_id, self.parser_id)
    }
}

impl std::fmt::Display for BuildKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.parser_id)
    }
}

fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidIdentifier {
        field,
        reason: reason.to_string(),
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(invalid(&format!(
            "must be at most {} characters",
            MAX_IDENTIFIER_LENGTH
        )));
    }
    if !value.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("must start with a letter or digit"));
    }
    if !value.ends_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(invalid("must end with a letter or digit"));
    }
    // Identifiers become image repository path components, which are lowercase
    if let Some(c) = value.chars().find(|c| {
        !(c.is_ascii_lowercase() || c.is_ascii_digit() || is_separator(*c))
    }) {
        return Err(invalid(&format!("contains invalid character {:?}", c)));
    }
    if value
        .as_bytes()
        .windows(2)
        .any(|pair| is_separator(pair[0] as char) && is_separator(pair[1] as char))
    {
        return Err(invalid("must not contain consecutive '-', '_' or '.'"));
    }
    Ok(())
}

fn is_separator(c: char) -> bool {
    matches!(c, '-' | '_' | '.')
}

/// One requested build, created from an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    /// Inbound event id, the idempotency key
    pub request_id: String,
    pub tenant_id: String,
    pub parser_id: String,
    pub received_at: DateTime<Utc>,
}

impl BuildRequest {
    pub fn new(request_id: impl Into<String>, key: BuildKey, received_at: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            tenant_id: key.tenant_id,
            parser_id: key.parser_id,
            received_at,
        }
    }

    pub fn key(&self) -> BuildKey {
        BuildKey {
            tenant_id: self.tenant_id.clone(),
            parser_id: self.parser_id.clone(),
        }
    }
}

/// Pipeline stage that may be attempted more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Assembling,
    Building,
    Publishing,
}

/// Attempts made per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAttempts {
    pub assembling: u32,
    pub building: u32,
    pub publishing: u32,
}

impl StageAttempts {
    pub fn add(&mut self, stage: Stage, attempts: u32) {
        match stage {
            Stage::Assembling => self.assembling += attempts,
            Stage::Building => self.building += attempts,
            Stage::Publishing => self.publishing += attempts,
        }
    }
}

/// Build lifecycle state
///
/// Received → Assembling → Building → Publishing → Completed, with a jump
/// to Failed allowed from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all_fields = "camelCase")]
pub enum BuildStatus {
    Received,
    Assembling,
    Building,
    Publishing,
    Completed { image: ImageRef },
    Failed { error_kind: ErrorKind, message: String },
}

impl BuildStatus {
    fn rank(&self) -> u8 {
        match self {
            BuildStatus::Received => 0,
            BuildStatus::Assembling => 1,
            BuildStatus::Building => 2,
            BuildStatus::Publishing => 3,
            BuildStatus::Completed { .. } => 4,
            BuildStatus::Failed { .. } => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuildStatus::Received => "Received",
            BuildStatus::Assembling => "Assembling",
            BuildStatus::Building => "Building",
            BuildStatus::Publishing => "Publishing",
            BuildStatus::Completed { .. } => "Completed",
            BuildStatus::Failed { .. } => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildStatus::Completed { .. } | BuildStatus::Failed { .. })
    }

    /// Owned by a running pipeline stage
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            BuildStatus::Assembling | BuildStatus::Building | BuildStatus::Publishing
        )
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            BuildStatus::Failed { error_kind, .. } => Some(*error_kind),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<&ImageRef> {
        match self {
            BuildStatus::Completed { image } => Some(image),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle record of one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub job_id: Uuid,
    pub request: BuildRequest,
    pub status: BuildStatus,
    pub attempts: StageAttempts,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    pub fn new(request: BuildRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            request,
            status: BuildStatus::Received,
            attempts: StageAttempts::default(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> BuildKey {
        self.request.key()
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }

    /// Moves to `next`, which must be the following stage or Failed
    pub fn advance(&mut self, next: BuildStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::AlreadyTerminal(self.status.name()));
        }

        let failing = matches!(next, BuildStatus::Failed { .. });
        if !failing && next.rank() != self.status.rank() + 1 {
            return Err(TransitionError::OutOfOrder {
                from: self.status.name(),
                to: next.name(),
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() && !failing {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    pub fn complete(&mut self, image: ImageRef) -> Result<(), TransitionError> {
        self.advance(BuildStatus::Completed { image })
    }

    pub fn fail(
        &mut self,
        error_kind: ErrorKind,
        message: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.advance(BuildStatus::Failed {
            error_kind,
            message: message.into(),
        })
    }

    pub fn image_digest(&self) -> Option<&str> {
        self.status.image().and_then(|image| image.digest.as_deref())
    }
}
