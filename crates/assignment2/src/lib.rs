//! # assignment2
//!
//! A versioned bucket, a function that is told the bucket's name, and a
//! table keyed by `id`. The function's role may read and write both.
//!
//! [`Assignment2Stack::define`] only declares constructs into a
//! [`Stack`]; planning and applying is left to the caller, see the `infra`
//! binary.
use form::{
    aws::{
        dynamodb::{Attribute, AttributeType, Table, TableOutput},
        iam::{Grant, GrantOutput, Role, RoleOutput, LAMBDA_BASIC_EXECUTION_POLICY},
        lambda::{Code, Function, FunctionOutput, Runtime},
        s3::{Bucket, BucketOutput},
        Aws, PhysicalName,
    },
    Construct, Stack,
};

mod props;

pub use props::{FunctionSource, PropsError, StackProps};

pub const BUCKET_ID: &str = "MyFirstBucket";
pub const ROLE_ID: &str = "MyLambdaServiceRole";
pub const FUNCTION_ID: &str = "MyLambda";
pub const TABLE_ID: &str = "MyTable";
pub const BUCKET_GRANT_ID: &str = "MyLambdaBucketGrant";
pub const TABLE_GRANT_ID: &str = "MyLambdaTableGrant";

/// Source of the default function, shipped inline as `index.js`.
pub const INLINE_HANDLER: &str = r#"exports.handler = async function(event) {
  console.log("Lambda invoked!");
  return {
    statusCode: 200,
    body: "Hello, World!",
  };
};
"#;

/// Handles to every construct of the stack.
pub struct Assignment2Stack {
    pub bucket: Construct<Bucket, BucketOutput>,
    pub role: Construct<Role, RoleOutput>,
    pub function: Construct<Function, FunctionOutput>,
    pub table: Construct<Table, TableOutput>,
    pub bucket_grant: Construct<Grant, GrantOutput>,
    pub table_grant: Construct<Grant, GrantOutput>,
}

impl Assignment2Stack {
    /// Declare the stack into `scope`.
    ///
    /// `id` prefixes the generated physical names. Without `props` the
    /// defaults of [`StackProps`] apply.
    ///
    /// ## Errors
    /// Errs if any of the construct ids is already declared in `scope`, or if
    /// the configured deployment package can't be hashed.
    pub fn define(
        scope: &mut Stack<Aws>,
        id: &str,
        props: Option<StackProps>,
    ) -> Result<Self, form::Error> {
        let props = props.unwrap_or_default();
        log::debug!("defining stack '{id}' with {props:?}");

        let bucket = Bucket {
            bucket_name: PhysicalName::generated(id, BUCKET_ID),
            versioned: props.bucket_versioned,
            removal_policy: props.removal_policy,
        };
        let bucket = if props.import_existing {
            scope.import(BUCKET_ID, bucket)?
        } else {
            scope.resource(BUCKET_ID, bucket)?
        };

        let role = scope.resource(
            ROLE_ID,
            Role::for_service(
                PhysicalName::generated(id, ROLE_ID),
                "lambda.amazonaws.com",
            )
            .with_managed_policy(LAMBDA_BASIC_EXECUTION_POLICY),
        )?;

        let (runtime, handler, code) = match &props.function {
            FunctionSource::InlineNode => (
                Runtime::Nodejs18x,
                "index.handler",
                Code::inline(INLINE_HANDLER),
            ),
            FunctionSource::RustBootstrap { zip_path } => (
                Runtime::ProvidedAl2023,
                "bootstrap",
                Code::zip_file(zip_path)?,
            ),
        };
        let mut function = Function::new(
            PhysicalName::generated(id, FUNCTION_ID),
            runtime,
            handler,
            code,
            role.remote(|role| role.arn.clone()),
        )
        .with_env("BUCKET_NAME", bucket.remote(|bucket| bucket.name.clone()));
        function.memory_size = props.memory_size;
        function.timeout_secs = props.timeout_secs;
        let function = scope.resource(FUNCTION_ID, function)?;

        let table = Table::new(
            PhysicalName::fixed(&props.table_name),
            Attribute::new("id", AttributeType::String),
        )
        .with_removal_policy(props.removal_policy);
        let table = if props.import_existing {
            scope.import(TABLE_ID, table)?
        } else {
            scope.resource(TABLE_ID, table)?
        };

        let bucket_grant = scope.resource(BUCKET_GRANT_ID, bucket.grant_read_write(&function))?;
        let table_grant = scope.resource(
            TABLE_GRANT_ID,
            table.grant_read_write_data(&function),
        )?;

        Ok(Self {
            bucket,
            role,
            function,
            table,
            bucket_grant,
            table_grant,
        })
    }
}
