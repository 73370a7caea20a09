//! Tool registry implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use std::sync::Arc;

use agentbox_core::{
    traits::{Tool, ToolRegistry},
    types::{ToolDefinition, ToolOutput, ToolRiskLevel},
    Error, Result,
};
use agentbox_sandbox::{sandbox_tools, SandboxManager};

/// Default tool registry using DashMap.
///
/// Tools are checked when they are registered (name, description, parameter
/// schema) and calls are checked against the schema's `required` list
/// before dispatch.
pub struct DefaultToolRegistry {
    /// Registered tools.
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl DefaultToolRegistry {
    /// Create a new tool registry.
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Get the number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Risk level of a registered tool.
    pub fn risk_level(&self, name: &str) -> Option<ToolRiskLevel> {
        self.tools.get(name).map(|t| t.risk_level())
    }
}

impl Default for DefaultToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_tool(tool: &dyn Tool) -> Result<()> {
    let name = tool.name();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::invalid_request(format!(
            "Tool name '{}' must be non-empty snake_case",
            name
        )));
    }
    if tool.description().trim().is_empty() {
        return Err(Error::invalid_request(format!(
            "Tool '{}' has no description",
            name
        )));
    }
    let schema = tool.parameters();
    if schema.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(Error::invalid_request(format!(
            "Tool '{}' parameters must be a JSON object schema",
            name
        )));
    }
    if let Some(required) = schema.get("required") {
        let properties = schema.get("properties");
        let names = required.as_array().ok_or_else(|| {
            Error::invalid_request(format!("Tool '{}' has a malformed 'required' list", name))
        })?;
        for key in names {
            let key = key.as_str().unwrap_or_default();
            if properties.and_then(|p| p.get(key)).is_none() {
                return Err(Error::invalid_request(format!(
                    "Tool '{}' requires undeclared parameter '{}'",
                    name, key
                )));
            }
        }
    }
    Ok(())
}

fn validate_args(tool: &dyn Tool, args: &Value) -> Result<()> {
    if !args.is_object() {
        return Err(Error::invalid_request(format!(
            "Arguments for '{}' must be a JSON object",
            tool.name()
        )));
    }
    let schema = tool.parameters();
    let missing: Vec<&str> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|keys| {
            keys.iter()
                .filter_map(|k| k.as_str())
                .filter(|k| args.get(*k).is_none())
                .collect()
        })
        .unwrap_or_default();
    if !missing.is_empty() {
        return Err(Error::invalid_request(format!(
            "Missing required argument(s) for '{}': {}",
            tool.name(),
            missing.join(", ")
        )));
    }
    Ok(())
}

#[async_trait]
impl ToolRegistry for DefaultToolRegistry {
    async fn register(&self, tool: Box<dyn Tool>) -> Result<()> {
        validate_tool(tool.as_ref())?;
        let name = tool.name().to_string();

        match self.tools.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::invalid_request(format!(
                "Tool '{}' is already registered",
                name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                tracing::info!(tool = %name, "Registering tool");
                slot.insert(Arc::from(tool));
                Ok(())
            }
        }
    }

    async fn list(&self) -> Result<Vec<ToolDefinition>> {
        let mut definitions: Vec<_> = self
            .tools
            .iter()
            .map(|entry| ToolDefinition {
                name: entry.name().to_string(),
                description: entry.description().to_string(),
                parameters: entry.parameters(),
                risk_level: entry.risk_level(),
            })
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(definitions)
    }

    async fn execute(&self, name: &str, args: Value) -> Result<ToolOutput> {
        // Clone the Arc so no map guard is held across the await.
        let tool = self
            .tools
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::tool_not_found(name))?;

        validate_args(tool.as_ref(), &args)?;
        tracing::debug!(tool = %name, "Executing tool");

        tool.execute(args).await
    }
}

/// Register every sandbox tool bound to `manager`.
pub async fn register_sandbox_tools(
    registry: &dyn ToolRegistry,
    manager: Arc<SandboxManager>,
) -> Result<()> {
    for tool in sandbox_tools(manager) {
        registry.register(tool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentbox_sandbox::{MockEngine, SandboxConfiguration};
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the message back"
        }

        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            })
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput> {
            let message = args["message"].as_str().unwrap_or_default();
            Ok(ToolOutput::text(format!("Echo: {}", message)))
        }
    }

    struct BadSchemaTool;

    #[async_trait]
    impl Tool for BadSchemaTool {
        fn name(&self) -> &str {
            "bad_schema"
        }

        fn description(&self) -> &str {
            "Declares a required parameter it never describes"
        }

        fn parameters(&self) -> Value {
            json!({ "type": "object", "properties": {}, "required": ["ghost"] })
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::text("unreachable"))
        }
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = DefaultToolRegistry::new();

        registry.register(Box::new(EchoTool)).await.unwrap();

        let tools = registry.list().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
        assert_eq!(tools[0].risk_level, ToolRiskLevel::Low);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = DefaultToolRegistry::new();
        registry.register(Box::new(EchoTool)).await.unwrap();

        let err = registry.register(Box::new(EchoTool)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_schema_rejected() {
        let registry = DefaultToolRegistry::new();
        assert!(registry.register(Box::new(BadSchemaTool)).await.is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_execute() {
        let registry = DefaultToolRegistry::new();

        registry.register(Box::new(EchoTool)).await.unwrap();

        let result = registry
            .execute("echo", json!({"message": "Hello"}))
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.content.contains("Hello"));
    }

    #[tokio::test]
    async fn test_execute_missing_argument() {
        let registry = DefaultToolRegistry::new();
        registry.register(Box::new(EchoTool)).await.unwrap();

        let err = registry.execute("echo", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("message"));
    }

    #[tokio::test]
    async fn test_execute_not_found() {
        let registry = DefaultToolRegistry::new();

        let result = registry.execute("nonexistent", json!({})).await;

        assert!(matches!(result, Err(Error::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_sandbox_tools() {
        let registry = DefaultToolRegistry::new();
        let engine = Arc::new(MockEngine::new().with_image("agentbox-sandbox:latest"));
        let manager = Arc::new(SandboxManager::new(engine, SandboxConfiguration::default()));

        register_sandbox_tools(&registry, manager.clone()).await.unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.risk_level("sandbox_shell"), Some(ToolRiskLevel::High));

        let output = registry
            .execute("sandbox_shell", json!({"command": "echo dispatched"}))
            .await
            .unwrap();
        assert_eq!(output.content, "dispatched\n");

        manager.teardown().await.unwrap();
    }
}
