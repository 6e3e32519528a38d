use lambda_runtime::{Context, LambdaEvent};

use super::*;

async fn invoke(payload: Value) -> HelloResponse {
    function_handler(LambdaEvent::new(payload, Context::default()))
        .await
        .unwrap()
}

#[tokio::test]
async fn answers_hello_world_for_any_event() {
    let events = [
        serde_json::json!({}),
        serde_json::json!(null),
        serde_json::json!({"Records": [{"s3": {"object": {"key": "a.txt"}}}]}),
        serde_json::json!("just a string"),
    ];
    for event in events {
        let response = invoke(event).await;
        assert_eq!(200, response.status_code);
        assert_eq!("Hello, World!", response.body);
    }
}

#[tokio::test]
async fn response_uses_proxy_field_names() {
    let response = invoke(serde_json::json!({})).await;
    assert_eq!(
        serde_json::json!({"statusCode": 200, "body": "Hello, World!"}),
        serde_json::to_value(response).unwrap()
    );
}
