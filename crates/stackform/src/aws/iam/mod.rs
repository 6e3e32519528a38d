//! IAM infrastructure.
use anyhow::Context;
use aws_config::SdkConfig;

use super::{
    lambda::{Function, FunctionOutput},
    resolved, Aws, PhysicalName,
};
use crate::{Construct, HasDependencies, Remote, Resource};

/// Role names are limited to 64 characters.
pub const MAX_ROLE_NAME_LEN: usize = 64;

/// Managed policy that lets a function write its logs.
pub const LAMBDA_BASIC_EXECUTION_POLICY: &str =
    "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole";

/// The role name is the last path segment of a role ARN, eg.
/// `arn:aws:iam::123456789012:role/service-role/my-role` is `my-role`.
pub fn role_name_from_arn(arn: &str) -> String {
    arn.rsplit('/').next().unwrap_or(arn).to_owned()
}

/// AWS role resource.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Role {
    #[form(skip)]
    pub role_name: PhysicalName,
    /// Trust policy document.
    #[form(skip)]
    pub assume_role_policy: serde_json::Value,
    pub managed_policy_arns: Vec<String>,
}

impl Role {
    /// A role that can be assumed by the given service principal, eg.
    /// `"lambda.amazonaws.com"`.
    pub fn for_service(role_name: PhysicalName, service: &str) -> Self {
        Self {
            role_name,
            assume_role_policy: serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": service },
                    "Action": "sts:AssumeRole"
                }]
            }),
            managed_policy_arns: vec![],
        }
    }

    pub fn with_managed_policy(mut self, policy_arn: impl Into<String>) -> Self {
        self.managed_policy_arns.push(policy_arn.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoleOutput {
    pub name: String,
    pub arn: String,
}

pub async fn attach_policy(
    cfg: &SdkConfig,
    role_name: &str,
    policy_arn: &str,
) -> anyhow::Result<()> {
    let client = aws_sdk_iam::Client::new(cfg);
    let _ = client
        .attach_role_policy()
        .role_name(role_name)
        .policy_arn(policy_arn)
        .send()
        .await?;
    log::info!("...attached policy {policy_arn} to role {role_name}");
    Ok(())
}

pub async fn detach_policy(
    cfg: &SdkConfig,
    role_name: &str,
    policy_arn: &str,
) -> anyhow::Result<()> {
    let client = aws_sdk_iam::Client::new(cfg);
    let _ = client
        .detach_role_policy()
        .role_name(role_name)
        .policy_arn(policy_arn)
        .send()
        .await?;
    log::info!("...detached policy {policy_arn} from role {role_name}");
    Ok(())
}

impl Resource for Role {
    type Provider = Aws;
    type Error = anyhow::Error;
    type Output = RoleOutput;

    fn kind() -> &'static str {
        "AWS::IAM::Role"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.role_name.resolve(MAX_ROLE_NAME_LEN);
        let client = aws_sdk_iam::Client::new(provider.as_ref());
        let iam_role = client
            .create_role()
            .role_name(&name)
            .assume_role_policy_document(serde_json::to_string(&self.assume_role_policy)?)
            .send()
            .await?
            .role
            .context("no role")?;
        log::info!("...created role {name}");
        for policy_arn in &self.managed_policy_arns {
            attach_policy(provider.as_ref(), &name, policy_arn).await?;
        }
        Ok(RoleOutput {
            name,
            arn: iam_role.arn,
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.role_name.resolve(MAX_ROLE_NAME_LEN);
        let client = aws_sdk_iam::Client::new(provider.as_ref());
        let iam_role = client
            .get_role()
            .role_name(&name)
            .send()
            .await?
            .role
            .context("no role")?;
        Ok(RoleOutput {
            name,
            arn: iam_role.arn,
        })
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        anyhow::ensure!(
            self.role_name == previous_local.role_name,
            "role {} cannot be renamed in place, destroy it first",
            previous_remote.name
        );
        let name = previous_remote.name.as_str();
        let cfg = provider.as_ref();
        if self.assume_role_policy != previous_local.assume_role_policy {
            log::info!("updating trust policy of role {name}");
            aws_sdk_iam::Client::new(cfg)
                .update_assume_role_policy()
                .role_name(name)
                .policy_document(serde_json::to_string(&self.assume_role_policy)?)
                .send()
                .await?;
        }
        for policy_arn in &previous_local.managed_policy_arns {
            if !self.managed_policy_arns.contains(policy_arn) {
                detach_policy(cfg, name, policy_arn).await?;
            }
        }
        for policy_arn in &self.managed_policy_arns {
            if !previous_local.managed_policy_arns.contains(policy_arn) {
                attach_policy(cfg, name, policy_arn).await?;
            }
        }
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        let name = previous_remote.name.as_str();
        let cfg = provider.as_ref();
        let client = aws_sdk_iam::Client::new(cfg);

        // A role can't be deleted while it still has policies.
        let inline = client.list_role_policies().role_name(name).send().await?;
        for policy_name in inline.policy_names() {
            log::info!("deleting inline policy {policy_name} of role {name}");
            client
                .delete_role_policy()
                .role_name(name)
                .policy_name(policy_name)
                .send()
                .await?;
        }
        let attached = client
            .list_attached_role_policies()
            .role_name(name)
            .send()
            .await?;
        for policy in attached.attached_policies() {
            if let Some(policy_arn) = policy.policy_arn() {
                detach_policy(cfg, name, policy_arn).await?;
            }
        }

        let _ = client.delete_role().role_name(name).send().await?;
        log::info!("...deleted role {name}");
        Ok(())
    }
}

/// A single `Allow` statement.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct PolicyStatement {
    pub actions: Vec<String>,
    /// ARNs the actions apply to.
    pub resources: Vec<Remote<String>>,
}

impl PolicyStatement {
    pub fn allow<S: Into<String>>(
        actions: impl IntoIterator<Item = S>,
        resources: Vec<Remote<String>>,
    ) -> Self {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
            resources,
        }
    }
}

/// An inline policy on a role, granting a principal access to a resource.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Grant {
    pub policy_name: String,
    pub role_name: Remote<String>,
    pub statement: PolicyStatement,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GrantOutput {
    pub policy_name: String,
    pub role_name: String,
}

impl Grant {
    /// Grant to a function's execution role.
    ///
    /// The policy is named after the function's and the resource's construct
    /// ids, eg. `MyLambdaMyTablePolicy`.
    pub fn to_function(
        grantee: &Construct<Function, FunctionOutput>,
        resource_id: &str,
        statement: PolicyStatement,
    ) -> Self {
        Self {
            policy_name: format!("{}{resource_id}Policy", grantee.id()),
            role_name: grantee.remote(|function| role_name_from_arn(&function.role_arn)),
            statement,
        }
    }

    /// The policy document, with every token resolved.
    pub fn document(&self) -> anyhow::Result<serde_json::Value> {
        let resources = self
            .statement
            .resources
            .iter()
            .map(resolved)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Action": self.statement.actions,
                "Resource": resources
            }]
        }))
    }

    async fn put(&self, cfg: &SdkConfig) -> anyhow::Result<GrantOutput> {
        let role_name = resolved(&self.role_name)?;
        let document = serde_json::to_string(&self.document()?)?;
        log::debug!("putting policy {} on role {role_name}: {document}", self.policy_name);
        aws_sdk_iam::Client::new(cfg)
            .put_role_policy()
            .role_name(&role_name)
            .policy_name(&self.policy_name)
            .policy_document(document)
            .send()
            .await?;
        log::info!("...put policy {} on role {role_name}", self.policy_name);
        Ok(GrantOutput {
            policy_name: self.policy_name.clone(),
            role_name,
        })
    }
}

impl Resource for Grant {
    type Provider = Aws;
    type Error = anyhow::Error;
    type Output = GrantOutput;

    fn kind() -> &'static str {
        "AWS::IAM::Policy"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        self.put(provider.as_ref()).await
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let role_name = resolved(&self.role_name)?;
        aws_sdk_iam::Client::new(provider.as_ref())
            .get_role_policy()
            .role_name(&role_name)
            .policy_name(&self.policy_name)
            .send()
            .await?;
        Ok(GrantOutput {
            policy_name: self.policy_name.clone(),
            role_name,
        })
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        _previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        let output = self.put(provider.as_ref()).await?;
        if output != *previous_remote {
            self.delete(provider, previous_remote).await?;
        }
        Ok(output)
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        let GrantOutput {
            policy_name,
            role_name,
        } = previous_remote;
        let result = aws_sdk_iam::Client::new(provider.as_ref())
            .delete_role_policy()
            .role_name(role_name)
            .policy_name(policy_name)
            .send()
            .await;
        match result {
            Ok(_) => log::info!("...deleted policy {policy_name} from role {role_name}"),
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_no_such_entity_exception())
                    .unwrap_or_default() =>
            {
                log::warn!("policy {policy_name} is already gone from role {role_name}");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn role_name_is_the_last_arn_segment() {
        assert_eq!(
            "my-role",
            role_name_from_arn("arn:aws:iam::123456789012:role/service-role/my-role")
        );
        assert_eq!("plain", role_name_from_arn("plain"));
    }

    #[test]
    fn grant_document_resolves_resources() {
        let bucket_arn: Remote<String> = serde_json::from_value(serde_json::json!({
            "token": "MyFirstBucket",
            "value": "arn:aws:s3:::my-bucket"
        }))
        .unwrap();
        let role_name: Remote<String> =
            serde_json::from_value(serde_json::json!({"token": "MyLambda", "value": "role"}))
                .unwrap();
        let grant = Grant {
            policy_name: "MyLambdaMyFirstBucketPolicy".into(),
            role_name,
            statement: PolicyStatement::allow(
                ["s3:GetObject*", "s3:PutObject"],
                vec![bucket_arn.clone(), bucket_arn.map(|arn| format!("{arn}/*"))],
            ),
        };
        assert_eq!(
            serde_json::json!({
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Action": ["s3:GetObject*", "s3:PutObject"],
                    "Resource": ["arn:aws:s3:::my-bucket", "arn:aws:s3:::my-bucket/*"]
                }]
            }),
            grant.document().unwrap()
        );
        assert_eq!(
            vec!["MyLambda".to_owned(), "MyFirstBucket".to_owned()],
            grant.dependencies().into_iter().collect::<Vec<_>>()
        );
    }
}
