//! AWS S3 Bucket infrastructure.
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration,
    VersioningConfiguration,
};

use super::{
    iam::{Grant, PolicyStatement},
    lambda::{Function, FunctionOutput},
    Aws, PhysicalName, RemovalPolicy,
};
use crate::{Construct, HasDependencies, Resource};

/// Bucket names are limited to 63 characters.
pub const MAX_NAME_LEN: usize = 63;

/// Actions granted by [`Construct::<Bucket, BucketOutput>::grant_read_write`].
pub const READ_WRITE_ACTIONS: &[&str] = &[
    "s3:GetObject*",
    "s3:GetBucket*",
    "s3:List*",
    "s3:DeleteObject*",
    "s3:PutObject",
    "s3:PutObjectLegalHold",
    "s3:PutObjectRetention",
    "s3:PutObjectTagging",
    "s3:PutObjectVersionTagging",
    "s3:Abort*",
];

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Bucket {
    #[form(skip)]
    pub bucket_name: PhysicalName,
    pub versioned: bool,
    #[form(skip)]
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BucketOutput {
    pub name: String,
    pub arn: String,
}

impl BucketOutput {
    fn new(name: String) -> Self {
        Self {
            arn: format!("arn:aws:s3:::{name}"),
            name,
        }
    }
}

async fn put_versioning(
    client: &aws_sdk_s3::Client,
    name: &str,
    enabled: bool,
) -> anyhow::Result<()> {
    let status = if enabled {
        BucketVersioningStatus::Enabled
    } else {
        BucketVersioningStatus::Suspended
    };
    log::debug!("setting versioning of bucket {name} to {status:?}");
    client
        .put_bucket_versioning()
        .bucket(name)
        .versioning_configuration(VersioningConfiguration::builder().status(status).build())
        .send()
        .await?;
    Ok(())
}

impl Resource for Bucket {
    type Provider = Aws;
    type Error = anyhow::Error;
    type Output = BucketOutput;

    fn kind() -> &'static str {
        "AWS::S3::Bucket"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.bucket_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_s3::Client::new(provider.as_ref());
        let mut request = client.create_bucket().bucket(&name);
        // us-east-1 rejects an explicit location constraint
        if let Some(region) = provider.region().filter(|region| *region != "us-east-1") {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(region))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => log::info!("...created bucket {name}"),
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you())
                    .unwrap_or_default() =>
            {
                log::warn!("bucket {name} already exists and is owned by this account, adopting it");
            }
            Err(e) => return Err(e.into()),
        }
        if self.versioned {
            put_versioning(&client, &name, true).await?;
        }
        Ok(BucketOutput::new(name))
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.bucket_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_s3::Client::new(provider.as_ref());
        client.head_bucket().bucket(&name).send().await?;
        Ok(BucketOutput::new(name))
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        anyhow::ensure!(
            self.bucket_name == previous_local.bucket_name,
            "bucket {} cannot be renamed in place, destroy it first",
            previous_remote.name
        );
        if self.versioned != previous_local.versioned {
            let client = aws_sdk_s3::Client::new(provider.as_ref());
            put_versioning(&client, &previous_remote.name, self.versioned).await?;
        }
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        if self.removal_policy == RemovalPolicy::Retain {
            log::info!("retaining bucket {}", previous_remote.name);
            return Ok(());
        }
        let client = aws_sdk_s3::Client::new(provider.as_ref());
        client
            .delete_bucket()
            .bucket(&previous_remote.name)
            .send()
            .await?;
        log::info!("...deleted bucket {}", previous_remote.name);
        Ok(())
    }
}

impl Construct<Bucket, BucketOutput> {
    /// Allow the function's execution role to read and write objects in
    /// this bucket.
    ///
    /// The returned policy still has to be declared in the stack.
    pub fn grant_read_write(&self, grantee: &Construct<Function, FunctionOutput>) -> Grant {
        let arn = self.remote(|bucket| bucket.arn.clone());
        Grant::to_function(
            grantee,
            self.id(),
            PolicyStatement::allow(
                READ_WRITE_ACTIONS.iter().copied(),
                vec![arn.clone(), arn.map(|arn| format!("{arn}/*"))],
            ),
        )
    }
}
