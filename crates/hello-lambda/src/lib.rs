//! The placeholder function behind `MyLambda`.
//!
//! Every invocation logs `Lambda invoked!` and answers with status 200 and
//! the body `Hello, World!`, whatever the event.
use lambda_runtime::{Error, LambdaEvent};
use serde_json::Value;

#[cfg(test)]
mod test;

pub const GREETING: &str = "Hello, World!";

/// API Gateway style proxy response.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HelloResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

pub async fn function_handler(event: LambdaEvent<Value>) -> Result<HelloResponse, Error> {
    tracing::info!(request_id = %event.context.request_id, "Lambda invoked!");
    Ok(HelloResponse {
        status_code: 200,
        body: GREETING.to_owned(),
    })
}
