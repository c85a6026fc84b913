use async_trait::async_trait;
use loomcore::{
    ExecutableNode, Item, NodeContext, NodeError, NodeFailure, NodeInput, NodeOutput,
    NodeTypeDescription, NodeTypeDescriptor, ParameterKind, ParameterSpec, PortSpec, Value,
};
use std::collections::HashMap;

/// HTTP request node, one request per input item
pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn request(&self, ctx: &NodeContext, index: usize, item: &Item) -> Result<Item, NodeError> {
        let url = ctx
            .get_parameter("url", index, Value::Null)
            .as_str()
            .map(str::to_string)
            .or_else(|| item.json.get("url").and_then(|v| v.as_str().map(str::to_string)))
            .ok_or_else(|| NodeError::MissingInput("url".to_string()))?;
        let method_value = ctx.get_parameter("method", index, "GET");
        let method = method_value.as_str().unwrap_or("GET").to_uppercase();

        ctx.events.info(format!("{} {}", method, url));

        let body = ctx.get_parameter("body", index, Value::Null);
        let request = match method.as_str() {
            "GET" => self.client.get(&url),
            "DELETE" => self.client.delete(&url),
            "POST" | "PUT" => {
                let req = if method == "POST" {
                    self.client.post(&url)
                } else {
                    self.client.put(&url)
                };
                match body {
                    Value::Null => req.json(&item.json.to_plain_json()),
                    Value::String(text) => req.body(text),
                    other => req.json(&other.to_plain_json()),
                }
            }
            _ => return Err(NodeError::Configuration(format!("Unsupported method: {}", method))),
        };

        let request = match ctx.get_parameter("headers", index, Value::Null) {
            Value::Object(headers) => headers.iter().fold(request, |req, (key, value)| match value.as_str() {
                Some(val_str) => req.header(key, val_str),
                None => req,
            }),
            _ => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let headers_map: HashMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or("").to_string())))
            .collect();

        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::ExecutionFailed(format!("Failed to read response: {}", e)))?;

        ctx.events.info(format!("Response status: {}", status));

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), Value::Number(status as f64));
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&body_text) {
            fields.insert("json".to_string(), Value::from_plain_json(parsed));
        }
        fields.insert("body".to_string(), Value::String(body_text));
        fields.insert("headers".to_string(), Value::Object(headers_map));
        Ok(Item::new(fields).paired(index))
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutableNode for HttpRequestNode {
    async fn execute(&self, ctx: &NodeContext, input: NodeInput) -> Result<NodeOutput, NodeFailure> {
        let mut collector = ctx.collector();
        for (index, item) in input.into_items(0).iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(NodeError::Cancelled.into());
            }
            match self.request(ctx, index, item).await {
                Ok(response) => collector.push(0, response),
                Err(e) => collector.fail(index, e)?,
            }
        }
        Ok(collector.finish())
    }
}

pub fn descriptor() -> NodeTypeDescriptor {
    NodeTypeDescriptor::execute(
        NodeTypeDescription::new("http.request", 1u32)
            .with_display_name("HTTP Request")
            .with_description("Make HTTP requests")
            .with_category("http")
            .with_input(PortSpec::main("Input"))
            .with_output(PortSpec::main("Response"))
            .with_parameter(ParameterSpec::new("url", ParameterKind::String))
            .with_parameter(
                ParameterSpec::new(
                    "method",
                    ParameterKind::Options {
                        values: vec!["GET".into(), "POST".into(), "PUT".into(), "DELETE".into()],
                    },
                )
                .with_default("GET"),
            )
            .with_parameter(ParameterSpec::new("headers", ParameterKind::Json))
            .with_parameter(ParameterSpec::new("body", ParameterKind::Json)),
        HttpRequestNode::new(),
    )
}
