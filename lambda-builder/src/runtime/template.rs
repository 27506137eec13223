//! Build job template
//!
//! The template is a JSON document with `{{name}}` placeholders inside string
//! values. Values are JSON-escaped on substitution, so a rendered template is
//! always well-formed JSON.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::ResourceLimits;

const EMBEDDED_TEMPLATE: &str = include_str!("../../templates/kaniko-job.json");

pub const PLACEHOLDERS: &[&str] = &[
    "builder_image",
    "context",
    "image",
    "digest_file",
    "cpu_limit",
    "memory_limit",
    "memory_request",
    "job_name",
];

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to read job template {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown placeholder '{{{{{0}}}}}' in job template")]
    UnknownPlaceholder(String),

    #[error("unterminated placeholder in job template")]
    Unterminated,

    #[error("rendered job template is invalid: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Values substituted into the template for one build
pub struct TemplateParams<'a> {
    pub builder_image: &'a str,
    pub context: &'a str,
    pub image: &'a str,
    pub digest_file: &'a str,
    pub job_name: &'a str,
    pub resources: &'a ResourceLimits,
}

impl TemplateParams<'_> {
    fn value(&self, name: &str) -> Option<&str> {
        let value: &str = match name {
            "builder_image" => self.builder_image,
            "context" => self.context,
            "image" => self.image,
            "digest_file" => self.digest_file,
            "cpu_limit" => &self.resources.cpu_limit,
            "memory_limit" => &self.resources.memory_limit,
            "memory_request" => &self.resources.memory_request,
            "job_name" => self.job_name,
            _ => return None,
        };
        Some(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedResources {
    pub cpus: String,
    pub memory: String,
    pub memory_reservation: String,
}

/// Job description produced by rendering the template
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RenderedJob {
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub resources: RenderedResources,
}

#[derive(Debug, Clone)]
pub struct JobTemplate {
    source: String,
}

impl JobTemplate {
    /// Loads the template from `path`, or the embedded one when unset
    ///
    /// Unknown placeholders and templates that do not render to a valid job
    /// are rejected here, so a bad template fails at startup.
    pub fn load(path: Option<&Path>) -> Result<Self, TemplateError> {
        match path {
            None => Self::from_source(EMBEDDED_TEMPLATE.to_string()),
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_source(source)
            }
        }
    }

    pub fn from_source(source: String) -> Result<Self, TemplateError> {
        for name in placeholders(&source)? {
            if !PLACEHOLDERS.contains(&name) {
                return Err(TemplateError::UnknownPlaceholder(name.to_string()));
            }
        }

        let template = Self { source };

        // Trial render with dummy values
        let limits = ResourceLimits::default();
        template.render(&TemplateParams {
            builder_image: "builder",
            context: "/workspace/context.tar.gz",
            image: "registry/repo:tag",
            digest_file: "/workspace/digest",
            job_name: "trial",
            resources: &limits,
        })?;

        Ok(template)
    }

    pub fn render(&self, params: &TemplateParams<'_>) -> Result<RenderedJob, TemplateError> {
        let mut rendered = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();

        while let Some(start) = rest.find("{{") {
            rendered.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
            let name = after[..end].trim();
            let value = params
                .value(name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            rendered.push_str(&escape(value));
            rest = &after[end + 2..];
        }
        rendered.push_str(rest);

        Ok(serde_json::from_str(&rendered)?)
    }
}

fn placeholders(source: &str) -> Result<Vec<&str>, TemplateError> {
    let mut names = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or(TemplateError::Unterminated)?;
        names.push(after[..end].trim());
        rest = &after[end + 2..];
    }
    Ok(names)
}

/// JSON string escaping without the surrounding quotes
fn escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(limits: &ResourceLimits) -> TemplateParams<'_> {
        TemplateParams {
            builder_image: "gcr.io/kaniko-project/executor:v1.23.2",
            context: "/workspace/context.tar.gz",
            image: "registry.example.com/lambdas/acme/csv-v1:0123456789ab",
            digest_file: "/workspace/digest",
            job_name: "lb-42-1",
            resources: limits,
        }
    }

    #[test]
    fn test_embedded_template_renders() {
        let limits = ResourceLimits::default();
        let job = JobTemplate::load(None).unwrap().render(&params(&limits)).unwrap();

        assert_eq!(job.image, "gcr.io/kaniko-project/executor:v1.23.2");
        assert!(job.args.contains(&"--context=tar:///workspace/context.tar.gz".to_string()));
        assert!(job.args.contains(
            &"--destination=registry.example.com/lambdas/acme/csv-v1:0123456789ab".to_string()
        ));
        assert!(job.args.contains(&"--digest-file=/workspace/digest".to_string()));
        assert_eq!(job.env.get("JOB_NAME").map(String::as_str), Some("lb-42-1"));
        assert_eq!(job.resources.memory, "2g");
        assert_eq!(job.resources.memory_reservation, "512m");
    }

    #[test]
    fn test_unknown_placeholder_is_rejected() {
        let result = JobTemplate::from_source(
            r#"{"image": "{{registry_password}}", "resources": {}}"#.to_string(),
        );
        assert!(matches!(result, Err(TemplateError::UnknownPlaceholder(name)) if name == "registry_password"));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let result = JobTemplate::from_source(r#"{"image": "{{image}}""#.to_string());
        assert!(matches!(result, Err(TemplateError::Invalid(_))));
    }

    #[test]
    fn test_unterminated_placeholder() {
        let result = JobTemplate::from_source(r#"{"image": "{{image"}"#.to_string());
        assert!(matches!(result, Err(TemplateError::Unterminated)));
    }

    #[test]
    fn test_values_are_escaped() {
        let template = JobTemplate::from_source(
            r#"{"image": "{{image}}", "resources": {"cpus": "{{cpu_limit}}", "memory": "1g", "memoryReservation": "1g"}}"#
                .to_string(),
        )
        .unwrap();
        let limits = ResourceLimits::default();
        let mut p = params(&limits);
        p.image = "weird\"name";

        let job = template.render(&p).unwrap();
        assert_eq!(job.image, "weird\"name");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(&path, EMBEDDED_TEMPLATE).unwrap();

        assert!(JobTemplate::load(Some(&path)).is_ok());
        assert!(matches!(
            JobTemplate::load(Some(&dir.path().join("missing.json"))),
            Err(TemplateError::Io { .. })
        ));
    }
}
