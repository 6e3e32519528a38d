//! AWS Lambda infrastructure.
use std::{
    collections::{BTreeMap, HashMap},
    io::Write,
    path::PathBuf,
};

use anyhow::Context;
use aws_sdk_lambda::{
    primitives::Blob,
    types::{Environment, FunctionCode, LastUpdateStatus, PackageType, State},
};
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use super::{resolved, Aws, PhysicalName};
use crate::{utils::sha256_digest, Dependencies, HasDependencies, Remote, Resource};

/// Function names are limited to 64 characters.
pub const MAX_NAME_LEN: usize = 64;

/// How long a new execution role may take to become assumable.
const ROLE_PROPAGATION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Runtime {
    #[serde(rename = "nodejs18.x")]
    Nodejs18x,
    #[serde(rename = "provided.al2023")]
    ProvidedAl2023,
}

impl HasDependencies for Runtime {}

impl From<Runtime> for aws_sdk_lambda::types::Runtime {
    fn from(value: Runtime) -> Self {
        match value {
            Runtime::Nodejs18x => aws_sdk_lambda::types::Runtime::Nodejs18x,
            Runtime::ProvidedAl2023 => aws_sdk_lambda::types::Runtime::Providedal2023,
        }
    }
}

impl Runtime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runtime::Nodejs18x => "nodejs18.x",
            Runtime::ProvidedAl2023 => "provided.al2023",
        }
    }

    /// Name of the archive entry that inline source is stored under.
    fn inline_file_name(&self) -> &'static str {
        match self {
            Runtime::Nodejs18x => "index.js",
            Runtime::ProvidedAl2023 => "bootstrap",
        }
    }
}

impl core::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Function code.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Code {
    /// Source text, zipped in memory on deploy.
    Inline { source: String },
    /// A prebuilt deployment package.
    ///
    /// The hash is part of the definition so that rebuilding the package
    /// updates the function.
    ZipFile {
        path: PathBuf,
        sha256: Option<String>,
    },
}

impl HasDependencies for Code {}

impl Code {
    pub fn inline(source: impl Into<String>) -> Self {
        Code::Inline {
            source: source.into(),
        }
    }

    pub fn zip_file(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let sha256 = sha256_digest(&path)?;
        if sha256.is_none() {
            log::warn!("deployment package {path:?} does not exist yet");
        }
        Ok(Code::ZipFile { path, sha256 })
    }

    /// The deployment package bytes.
    pub fn archive(&self, runtime: Runtime) -> anyhow::Result<Vec<u8>> {
        match self {
            Code::Inline { source } => {
                let mut cursor = std::io::Cursor::new(Vec::new());
                {
                    let mut zip = ZipWriter::new(&mut cursor);
                    let options = FileOptions::default()
                        .compression_method(CompressionMethod::Deflated)
                        .unix_permissions(0o755);
                    zip.start_file(runtime.inline_file_name(), options)?;
                    zip.write_all(source.as_bytes())?;
                    zip.finish()?;
                }
                Ok(cursor.into_inner())
            }
            Code::ZipFile { path, .. } => std::fs::read(path)
                .with_context(|| format!("could not read deployment package {path:?}")),
        }
    }
}

/// An environment variable value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    Token(Remote<String>),
}

impl HasDependencies for EnvValue {
    fn dependencies(&self) -> Dependencies {
        match self {
            EnvValue::Literal(_) => Dependencies::default(),
            EnvValue::Token(remote) => remote.dependencies(),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(value: &str) -> Self {
        EnvValue::Literal(value.to_owned())
    }
}

impl From<String> for EnvValue {
    fn from(value: String) -> Self {
        EnvValue::Literal(value)
    }
}

impl From<Remote<String>> for EnvValue {
    fn from(value: Remote<String>) -> Self {
        EnvValue::Token(value)
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, HasDependencies)]
pub struct Function {
    #[form(skip)]
    pub function_name: PhysicalName,
    pub runtime: Runtime,
    pub handler: String,
    pub code: Code,
    pub environment: BTreeMap<String, EnvValue>,
    /// ARN of the execution role.
    pub role_arn: Remote<String>,
    /// In MB.
    pub memory_size: i32,
    pub timeout_secs: i32,
}

impl Function {
    /// A function with 128MB of memory, a 3 second timeout and an empty
    /// environment.
    pub fn new(
        function_name: PhysicalName,
        runtime: Runtime,
        handler: impl Into<String>,
        code: Code,
        role_arn: Remote<String>,
    ) -> Self {
        Self {
            function_name,
            runtime,
            handler: handler.into(),
            code,
            environment: BTreeMap::default(),
            role_arn,
            memory_size: 128,
            timeout_secs: 3,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<EnvValue>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    fn resolved_environment(&self) -> anyhow::Result<HashMap<String, String>> {
        self.environment
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    EnvValue::Literal(value) => value.clone(),
                    EnvValue::Token(remote) => resolved(remote)?,
                };
                Ok((key.clone(), value))
            })
            .collect()
    }

    fn configuration_changed(&self, previous: &Self) -> bool {
        self.runtime != previous.runtime
            || self.handler != previous.handler
            || self.environment != previous.environment
            || self.role_arn != previous.role_arn
            || self.memory_size != previous.memory_size
            || self.timeout_secs != previous.timeout_secs
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FunctionOutput {
    pub name: String,
    pub arn: String,
    /// ARN of the execution role.
    pub role_arn: String,
}

async fn wait_until_ready(client: &aws_sdk_lambda::Client, name: &str) -> anyhow::Result<()> {
    // timeout after 5 minutes
    let timeout_secs = 60 * 5;
    let start = std::time::Instant::now();
    log::info!("awaiting function {name} finalization");
    loop {
        let out = client
            .get_function_configuration()
            .function_name(name)
            .send()
            .await?;
        anyhow::ensure!(
            out.state != Some(State::Failed),
            "function {name} failed: {}",
            out.state_reason().unwrap_or("unknown")
        );
        anyhow::ensure!(
            out.last_update_status != Some(LastUpdateStatus::Failed),
            "function {name} update failed: {}",
            out.last_update_status_reason().unwrap_or("unknown")
        );
        let is_active = out.state == Some(State::Active);
        let is_settled = out.last_update_status != Some(LastUpdateStatus::InProgress);
        if is_active && is_settled {
            return Ok(());
        }
        if start.elapsed().as_secs() >= timeout_secs {
            anyhow::bail!("finalization timed out after {timeout_secs} seconds");
        }
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }
}

impl Resource for Function {
    type Provider = Aws;
    type Error = anyhow::Error;
    type Output = FunctionOutput;

    fn kind() -> &'static str {
        "AWS::Lambda::Function"
    }

    async fn create(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.function_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_lambda::Client::new(provider.as_ref());
        let role_arn = resolved(&self.role_arn)?;
        let variables = self.resolved_environment()?;
        let bytes = self.code.archive(self.runtime)?;
        log::debug!("sending {} bytes of code", bytes.len());

        let start = std::time::Instant::now();
        let out = loop {
            let result = client
                .create_function()
                .function_name(&name)
                .package_type(PackageType::Zip)
                .runtime(self.runtime.into())
                .role(&role_arn)
                .handler(&self.handler)
                .memory_size(self.memory_size)
                .timeout(self.timeout_secs)
                .environment(
                    Environment::builder()
                        .set_variables(Some(variables.clone()))
                        .build(),
                )
                .code(FunctionCode::builder().zip_file(Blob::new(bytes.clone())).build())
                .send()
                .await;
            match result {
                Ok(out) => break out,
                // A freshly created role takes a while to become assumable.
                Err(e)
                    if e.as_service_error()
                        .map(|e| e.is_invalid_parameter_value_exception())
                        .unwrap_or_default()
                        && start.elapsed().as_secs() < ROLE_PROPAGATION_TIMEOUT_SECS =>
                {
                    log::warn!("role {role_arn} cannot be assumed yet, retrying in 3 seconds");
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                }
                Err(e) => return Err(e.into()),
            }
        };
        let arn = out.function_arn.context("missing arn")?;
        log::info!("...created function {name}");
        wait_until_ready(&client, &name).await?;
        Ok(FunctionOutput {
            name,
            arn,
            role_arn,
        })
    }

    async fn read(&self, provider: &Self::Provider) -> Result<Self::Output, Self::Error> {
        let name = self.function_name.resolve(MAX_NAME_LEN);
        let client = aws_sdk_lambda::Client::new(provider.as_ref());
        let out = client
            .get_function_configuration()
            .function_name(&name)
            .send()
            .await?;
        Ok(FunctionOutput {
            arn: out.function_arn.context("missing arn")?,
            role_arn: out.role.context("missing role")?,
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
            self.function_name == previous_local.function_name,
            "function {} cannot be renamed in place, destroy it first",
            previous_remote.name
        );
        let name = previous_remote.name.as_str();
        let client = aws_sdk_lambda::Client::new(provider.as_ref());
        let role_arn = resolved(&self.role_arn)?;

        if self.configuration_changed(previous_local) {
            log::debug!("updating function configuration");
            client
                .update_function_configuration()
                .function_name(name)
                .runtime(self.runtime.into())
                .role(&role_arn)
                .handler(&self.handler)
                .memory_size(self.memory_size)
                .timeout(self.timeout_secs)
                .environment(
                    Environment::builder()
                        .set_variables(Some(self.resolved_environment()?))
                        .build(),
                )
                .send()
                .await?;
            wait_until_ready(&client, name).await?;
        }

        if self.code != previous_local.code || self.runtime != previous_local.runtime {
            log::debug!("updating function code");
            let bytes = self.code.archive(self.runtime)?;
            log::debug!("sending {} bytes of code", bytes.len());
            let out = client
                .update_function_code()
                .function_name(name)
                .zip_file(Blob::new(bytes))
                .send()
                .await?;
            log::debug!("last_update_status: {:?}", out.last_update_status);
            anyhow::ensure!(
                out.last_update_status != Some(LastUpdateStatus::Failed),
                "update failed!"
            );
            wait_until_ready(&client, name).await?;
        }

        log::info!("...updated function {name}");
        Ok(FunctionOutput {
            name: name.to_owned(),
            arn: previous_remote.arn.clone(),
            role_arn,
        })
    }

    async fn delete(
        &self,
        provider: &Self::Provider,
        previous_remote: &Self::Output,
    ) -> Result<(), Self::Error> {
        let name = previous_remote.name.as_str();
        let result = aws_sdk_lambda::Client::new(provider.as_ref())
            .delete_function()
            .function_name(name)
            .send()
            .await;
        match result {
            Ok(_) => log::info!("...deleted function {name}"),
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or_default() =>
            {
                log::warn!("function {name} is already gone");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;

    #[test]
    fn inline_code_is_zipped_as_index_js() {
        let source = "exports.handler = async () => ({ statusCode: 200 });";
        let bytes = Code::inline(source).archive(Runtime::Nodejs18x).unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut contents = String::new();
        archive
            .by_name("index.js")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(source, contents);
    }

    #[test]
    fn missing_zip_file_has_no_hash() {
        let path = std::env::temp_dir().join("stackform-lambda-missing-package.zip");
        let code = Code::zip_file(&path).unwrap();
        assert_eq!(Code::ZipFile { path, sha256: None }, code);
    }

    #[test]
    fn env_values_are_literals_or_tokens() {
        let environment: BTreeMap<String, EnvValue> = serde_json::from_value(serde_json::json!({
            "STAGE": "dev",
            "BUCKET_NAME": { "token": "MyFirstBucket", "value": "my-bucket" }
        }))
        .unwrap();
        assert_eq!(Some(&EnvValue::from("dev")), environment.get("STAGE"));
        assert_eq!(
            vec!["MyFirstBucket".to_owned()],
            environment.dependencies().into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn runtime_uses_aws_identifiers() {
        assert_eq!(
            serde_json::json!("nodejs18.x"),
            serde_json::to_value(Runtime::Nodejs18x).unwrap()
        );
        assert_eq!("provided.al2023", Runtime::ProvidedAl2023.to_string());
    }
}
