// Browser tools backed by the sandbox browser session

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{required_str, Tool, ToolContext, ToolOutcome};

const BROWSER_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetch a page in the sandbox browser
pub struct BrowseWebTool;

#[async_trait]
impl Tool for BrowseWebTool {
    fn name(&self) -> &str {
        "browse_web"
    }

    fn description(&self) -> &str {
        "Open a URL in the sandbox browser and return the page content"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "The URL to open"}
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let url = match required_str(&args, "url") {
            Ok(url) => url,
            Err(outcome) => return outcome,
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutcome::error("url must start with http:// or https://");
        }
        match tokio::time::timeout(BROWSER_TIMEOUT, ctx.sandbox.browse(url)).await {
            Ok(Ok(page)) => ToolOutcome::ok(page),
            Ok(Err(e)) => ToolOutcome::error(e.to_string()),
            Err(_) => ToolOutcome::error("browser timed out"),
        }
    }
}

/// Click an element on the current page
pub struct ClickElementTool;

#[async_trait]
impl Tool for ClickElementTool {
    fn name(&self) -> &str {
        "click_element"
    }

    fn description(&self) -> &str {
        "Click an element (CSS selector) on the current browser page"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "selector": {"type": "string", "description": "CSS selector of the element"}
            },
            "required": ["selector"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let selector = match required_str(&args, "selector") {
            Ok(selector) => selector,
            Err(outcome) => return outcome,
        };
        match tokio::time::timeout(BROWSER_TIMEOUT, ctx.sandbox.click(selector)).await {
            Ok(Ok(result)) => ToolOutcome::ok(result),
            Ok(Err(e)) => ToolOutcome::error(e.to_string()),
            Err(_) => ToolOutcome::error("browser timed out"),
        }
    }
}
