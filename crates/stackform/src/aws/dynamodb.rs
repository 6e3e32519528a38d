//! AWS DynamoDB infrastructure.
use anyhow::Context;
use aws_sdk_dynamodb::types as aws;

use super::{
    iam::{Grant, PolicyStatement},
    lambda::{Function, FunctionOutput},
    Aws, PhysicalName, RemovalPolicy,
};
use crate::{Construct, HasDependencies, Resource};

/// Table names are limited to 255 characters.
pub const MAX_NAME_LEN: usize = 255;

/// Actions granted by [`Construct::<Table, TableOutput>::grant_read_write_data`].
pub const READ_WRITE_DATA_ACTIONS: &[&str] = &[
    "dynamodb:BatchGetItem",
    "dynamodb:GetRecords",
    "dynamodb:GetShardIterator",
    "dynamodb:Query",
    "dynamodb:GetItem",
    "dynamodb:Scan",
    "dynamodb:ConditionCheckItem",
    "dynamodb:DescribeTable",
    "dynamodb:BatchWriteItem",
    "dynamodb:PutItem",
    "dynamodb:UpdateItem",
    "dynamodb:DeleteItem",
];

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum KeyType {
    Hash,
    Range,
}

impl From<KeyType> for aws::KeyType {
    fn from(value: KeyType) -> Self {
        match value {
            KeyType::Hash => aws::KeyType::Hash,
            KeyType::Range => aws::KeyType::Range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttributeType {
    Binary,
    Number,
    String,
}

impl From<AttributeType> for aws::ScalarAttributeType {
    fn from(value: AttributeType) -> Self {
        match value {
            AttributeType::Binary => aws::ScalarAttributeType::B,
            AttributeType::Number => aws::ScalarAttributeType::N,
            AttributeType::String => aws::ScalarAttributeType::S,
        }
    }
}

/// A key attribute.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
}

impl Attribute {
    pub fn new(name: impl Into<String>, attribute_type: AttributeType) -> Self {
        Self {
            name: name.into(),
            attribute_type,
        }
    }

    fn key_schema_element(&self, key_type: KeyType) -> anyhow::Result<aws::KeySchemaElement> {
        Ok(aws::KeySchemaElement::builder()
            .attribute_name(&self.name)
            .key_type(key_type.into())
            .build()?)
    }

    fn attribute_definition(&self) -> anyhow::Result<aws::AttributeDefinition> {
        Ok(aws::AttributeDefinition::builder()
            .attribute_name(&self.name)
            .attribute_type(self.attribute_type.into())
            .build()?)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TableClass {
    #[default]
    Standard,
    StandardInfrequentAccess,
}

impl From<TableClass> for aws::TableClass {
    fn from(value: TableClass) -> Self {
        match value {
            TableClass::Standard => aws::TableClass::Standard,
            TableClass::StandardInfrequentAccess => aws::TableClass::StandardInfrequentAccess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum BillingMode {
    PayPerRequest,
    Provisioned {
        read_capacity_units: i64,
        write_capacity_units: i64,
    },
}

impl Default for BillingMode {
    fn default() -> Self {
        BillingMode::Provisioned {
            read_capacity_units: 5,
            write_capacity_units: 5,
        }
    }
}

impl From<BillingMode> for aws::BillingMode {
    fn from(value: BillingMode) -> Self {
        match value {
            BillingMode::PayPerRequest => aws::BillingMode::PayPerRequest,
            BillingMode::Provisioned { .. } => aws::BillingMode::Provisioned,
        }
    }
}

impl BillingMode {
    fn provisioned_throughput(&self) -> anyhow::Result<Option<aws::ProvisionedThroughput>> {
        match self {
            BillingMode::PayPerRequest => Ok(None),
            BillingMode::Provisioned {
                read_capacity_units,
                write_capacity_units,
            } => Ok(Some(
                aws::ProvisionedThroughput::builder()
                    .read_capacity_units(*read_capacity_units)
                    .write_capacity_units(*write_capacity_units)
                    .build()?,
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Table {
    #[form(skip)]
    pub table_name: PhysicalName,
    #[form(skip)]
    pub partition_key: Attribute,
    #[form(skip)]
    pub sort_key: Option<Attribute>,
    #[form(skip)]
    #[serde(default)]
    pub billing_mode: BillingMode,
    #[form(skip)]
    #[serde(default)]
    pub table_class: TableClass,
    #[form(skip)]
    #[serde(default)]
    pub removal_policy: RemovalPolicy,
}

impl Table {
    /// A provisioned table with the given partition key.
    pub fn new(table_name: PhysicalName, partition_key: Attribute) -> Self {
        Self {
            table_name,
            partition_key,
            sort_key: None,
            billing_mode: BillingMode::default(),
            table_class: TableClass::default(),
            removal_policy: RemovalPolicy::default(),
        }
    }

    pub fn with_removal_policy(mut self, removal_policy: RemovalPolicy) -> Self {
        self.removal_policy = removal_policy;
        self
    }

    fn keys(&self) -> impl Iterator<Item = (&Attribute, KeyType)> {
        std::iter::once((&self.partition_key, KeyType::Hash))
            .chain(self.sort_key.iter().map(|key| (key, KeyType::Range)))
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableOutput {
    pub name: String,
    pub arn: String,
    pub id: Option<String>,
}

/// Wait for the table to become `ACTIVE`.
pub async fn finalize(cfg: &aws_config::SdkConfig, table_name: &str) -> anyhow::Result<()> {
    // timeout after 5 minutes
    let timeout_secs = 60 * 5;
    let start = std::time::Instant::now();
    log::info!("awaiting table {table_name} finalization");
    let client = aws_sdk_dynamodb::Client::new(cfg);
    loop {
        let out = client
            .describe_table()
            .table_name(table_name)
            .send()
            .await?;
        let table_info = out.table.context("missing table description")?;
        if table_info.table_status == Some(aws::TableStatus::Active) {
            return Ok(());
        }
        anyhow::ensure!(
            matches!(
                table_info.table_status,
                Some(aws::TableStatus::Creating) | Some(aws::TableStatus::Updating)
            ),
            "table finalization failed, table status: {:?}",
            table_info.table_status
        );
        if start.elapsed().as_secs() >= timeout_secs {
            anyhow::bail!("finalization timed out after {timeout_secs} seconds");
        }
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }
}

impl Resource for Table {
    type Provider = Aws;
    type Error = anyhow::Error;
    type Output = TableOutput;

    fn kind() -> &'static str {
        "AWS::DynamoDB::Table"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.table_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_dynamodb::Client::new(provider.as_ref());
        let key_schema = self
            .keys()
            .map(|(attribute, key_type)| attribute.key_schema_element(key_type))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let attribute_definitions = self
            .keys()
            .map(|(attribute, _)| attribute.attribute_definition())
            .collect::<anyhow::Result<Vec<_>>>()?;
        let out = client
            .create_table()
            .table_name(&name)
            .table_class(self.table_class.into())
            .billing_mode(self.billing_mode.into())
            .set_provisioned_throughput(self.billing_mode.provisioned_throughput()?)
            .set_key_schema(Some(key_schema))
            .set_attribute_definitions(Some(attribute_definitions))
            .send()
            .await?;
        let description = out.table_description.context("missing table description")?;
        let arn = description.table_arn.context("table missing arn")?;
        log::info!("table {name} {arn} creation started");
        finalize(provider.as_ref(), &name).await?;
        log::info!("...created table {name}");
        Ok(TableOutput {
            name,
            arn,
            id: description.table_id,
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.table_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_dynamodb::Client::new(provider.as_ref());
        let table_info = client
            .describe_table()
            .table_name(&name)
            .send()
            .await?
            .table
            .context("missing table description")?;
        Ok(TableOutput {
            arn: table_info.table_arn.context("table missing arn")?,
            id: table_info.table_id,
            name,
        })
    }

    async fn update(
        &self,
        provider: &Self::Provider,
        previous_local: &Self,
        previous_remote: &Self::Output,
    ) -> Result<Self::Output, Self::Error> {
        anyhow::ensure!(
            self.table_name == previous_local.table_name
                && self.partition_key == previous_local.partition_key
                && self.sort_key == previous_local.sort_key,
            "the name and keys of table {} cannot change in place, destroy it first",
            previous_remote.name
        );
        let name = previous_remote.name.as_str();
        if self.billing_mode != previous_local.billing_mode
            || self.table_class != previous_local.table_class
        {
            let client = aws_sdk_dynamodb::Client::new(provider.as_ref());
            client
                .update_table()
                .table_name(name)
                .billing_mode(self.billing_mode.into())
                .set_provisioned_throughput(self.billing_mode.provisioned_throughput()?)
                .table_class(self.table_class.into())
                .send()
                .await?;
            finalize(provider.as_ref(), name).await?;
            log::info!("...updated table {name}");
        }
        Ok(previous_remote.clone())
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        if self.removal_policy == RemovalPolicy::Retain {
            log::info!("retaining table {}", previous_remote.name);
            return Ok(());
        }
        let client = aws_sdk_dynamodb::Client::new(provider.as_ref());
        let _ = client
            .delete_table()
            .table_name(&previous_remote.name)
            .send()
            .await?;
        log::info!("...deleted table {}", previous_remote.name);
        Ok(())
    }
}

impl Construct<Table, TableOutput> {
    /// Allow the function's execution role to read and write items in this
    /// table.
    ///
    /// The returned policy still has to be declared in the stack.
    pub fn grant_read_write_data(&self, grantee: &Construct<Function, FunctionOutput>) -> Grant {
        Grant::to_function(
            grantee,
            self.id(),
            PolicyStatement::allow(
                READ_WRITE_DATA_ACTIONS.iter().copied(),
                vec![self.remote(|table| table.arn.clone())],
            ),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_attributes_serialize_like_cloudformation() {
        let table = Table::new(
            PhysicalName::fixed("MyTable"),
            Attribute::new("id", AttributeType::String),
        );
        let json = serde_json::to_value(&table).unwrap();
        assert_eq!(
            serde_json::json!({"name": "id", "type": "STRING"}),
            json["partition_key"]
        );
        assert!(table.dependencies().is_empty());
    }

    #[test]
    fn provisioned_throughput_defaults_to_five() {
        let throughput = BillingMode::default()
            .provisioned_throughput()
            .unwrap()
            .unwrap();
        assert_eq!(5, throughput.read_capacity_units());
        assert_eq!(5, throughput.write_capacity_units());
        assert!(BillingMode::PayPerRequest
            .provisioned_throughput()
            .unwrap()
            .is_none());
    }

    #[test]
    fn data_actions_have_no_duplicates() {
        let mut actions = READ_WRITE_DATA_ACTIONS.to_vec();
        actions.sort_unstable();
        actions.dedup();
        assert_eq!(READ_WRITE_DATA_ACTIONS.len(), actions.len());
    }
}
