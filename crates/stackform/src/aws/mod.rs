//! Stackform for AWS.
pub use aws_config::SdkConfig;

pub mod dynamodb;
pub mod iam;
pub mod lambda;
pub mod s3;

use crate::{Remote, Stack};

/// Resolve a token while talking to AWS.
fn resolved<X: Clone + core::fmt::Debug + 'static>(remote: &Remote<X>) -> anyhow::Result<X> {
    remote.get().map_err(|e| anyhow::anyhow!("{e}"))
}

/// The AWS provider: a wrapper around a loaded `SdkConfig`.
pub struct Aws(pub SdkConfig);

impl AsRef<SdkConfig> for Aws {
    fn as_ref(&self) -> &SdkConfig {
        &self.0
    }
}

impl Aws {
    /// Load configuration from the environment, optionally overriding the
    /// region and the named profile.
    pub async fn load(region: Option<String>, profile: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        if let Some(profile) = profile {
            loader = loader.profile_name(profile);
        }
        Aws(loader.load().await)
    }

    pub fn region(&self) -> Option<&str> {
        self.0.region().map(|region| region.as_ref())
    }
}

/// Register every AWS definition type with the stack, so state left behind
/// by any of them can be destroyed as an orphan.
pub fn register_all(stack: &mut Stack<Aws>) {
    stack
        .register::<iam::Grant>()
        .register::<lambda::Function>()
        .register::<dynamodb::Table>()
        .register::<s3::Bucket>()
        .register::<iam::Role>();
}

/// What happens to a resource on the platform when its construct is
/// destroyed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Delete the resource. Data is lost.
    Destroy,
    /// Leave the resource in place and only forget it locally.
    #[default]
    Retain,
}

/// The name a resource gets on the platform.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalName {
    Fixed(String),
    /// Derived from the stack and construct ids.
    Generated { stack: String, construct: String },
}

impl PhysicalName {
    pub fn fixed(name: impl Into<String>) -> Self {
        PhysicalName::Fixed(name.into())
    }

    pub fn generated(stack: impl Into<String>, construct: impl Into<String>) -> Self {
        PhysicalName::Generated {
            stack: stack.into(),
            construct: construct.into(),
        }
    }

    /// Resolve to a concrete name no longer than `max_len`.
    ///
    /// Generated names are lowercase `[a-z0-9-]` and end in a 12 character
    /// hash of the stack and construct ids, so they are stable across runs.
    pub fn resolve(&self, max_len: usize) -> String {
        match self {
            PhysicalName::Fixed(name) => name.clone(),
            PhysicalName::Generated { stack, construct } => {
                let hash = crate::utils::sha256_hex(format!("{stack}/{construct}"));
                let suffix = &hash[..12];
                let sanitized = format!("{stack}-{construct}")
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_lowercase()
                        } else {
                            '-'
                        }
                    })
                    .collect::<String>();
                let mut prefix = sanitized
                    .split('-')
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
                    .join("-");
                prefix.truncate(max_len.saturating_sub(suffix.len() + 1));
                let prefix = prefix.trim_end_matches('-');
                if prefix.is_empty() {
                    suffix.to_owned()
                } else {
                    format!("{prefix}-{suffix}")
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_names_are_stable_and_bounded() {
        let name = PhysicalName::generated("assignment2", "MyFirstBucket");
        let resolved = name.resolve(63);
        assert!(resolved.starts_with("assignment2-myfirstbucket-"), "{resolved}");
        assert_eq!(resolved, name.resolve(63));
        assert_eq!("assignment2-myfirstbucket-".len() + 12, resolved.len());

        let long = PhysicalName::generated("a-very-long-stack-identifier_for/tests", "MyLambdaServiceRole");
        let resolved = long.resolve(64);
        assert!(resolved.len() <= 64);
        assert!(resolved
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(!resolved.contains("--"));
    }

    #[test]
    fn fixed_names_are_used_verbatim() {
        assert_eq!("MyTable", PhysicalName::fixed("MyTable").resolve(255));
    }

    #[test]
    fn removal_policy_serializes_in_snake_case() {
        assert_eq!(
            serde_json::json!("destroy"),
            serde_json::to_value(RemovalPolicy::Destroy).unwrap()
        );
        assert_eq!(RemovalPolicy::Retain, RemovalPolicy::default());
    }
}
