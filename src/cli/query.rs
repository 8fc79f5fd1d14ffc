// ABOUTME: CLI query, tools, resources and read commands
//
// query goes through call_tool_safe (stale check, retrying connect, one
// reconnect-and-retry). The listing commands connect with retry first when
// the server does not auto-start, then use the basic call path.

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use super::{OutputFormat, QueryArgs, ReadArgs, ServerArgs};
use tmux_agentic::mcp_client::{McpClient, McpError, Operation, Response};

/// Parse tool arguments given on the command line
pub fn parse_arguments(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("Tool arguments must be valid JSON")?;
    if !value.is_object() {
        bail!("Tool arguments must be a JSON object");
    }
    Ok(Some(value))
}

/// Execute the query command
pub async fn execute(client: &McpClient, args: QueryArgs, format: OutputFormat) -> Result<()> {
    let arguments = parse_arguments(args.arguments.as_deref())?;
    let response = client
        .call_tool_safe(&args.server, &args.tool, arguments)
        .await
        .map_err(|e| describe(&args.server, e))?;
    print_response(&args.server, &response, format)
}

/// Execute the tools command
pub async fn tools(client: &McpClient, args: ServerArgs, format: OutputFormat) -> Result<()> {
    run(client, &args.server, &Operation::ListTools, format).await
}

/// Execute the resources command
pub async fn resources(client: &McpClient, args: ServerArgs, format: OutputFormat) -> Result<()> {
    run(client, &args.server, &Operation::ListResources, format).await
}

/// Execute the read command
pub async fn read(client: &McpClient, args: ReadArgs, format: OutputFormat) -> Result<()> {
    let operation = Operation::ReadResource { uri: args.uri };
    run(client, &args.server, &operation, format).await
}

async fn run(client: &McpClient, server: &str, operation: &Operation, format: OutputFormat) -> Result<()> {
    ensure_connected(client, server).await?;
    let response = client
        .invoke(server, operation)
        .await
        .map_err(|e| describe(server, e))?;
    print_response(server, &response, format)
}

/// Connect explicitly when calls would not connect on their own
pub async fn ensure_connected(client: &McpClient, server: &str) -> Result<()> {
    let config = client
        .server_config(server)
        .ok_or_else(|| anyhow!("Unknown MCP server: {server}"))?;
    if !config.auto_start {
        client
            .connect_with_retry(server)
            .await
            .map_err(|e| describe(server, e))?;
    }
    Ok(())
}

fn describe(server: &str, error: McpError) -> anyhow::Error {
    anyhow::Error::new(error).context(format!("MCP request to {server} failed"))
}

/// Print a response; an application error becomes a failed command
pub fn print_response(server: &str, response: &Response, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
        OutputFormat::Text if response.success => {
            let text = match response.result_value() {
                Some(value) => serde_json::to_string_pretty(&value)?,
                None => response.result.clone().unwrap_or_default(),
            };
            println!("{text}");
        }
        OutputFormat::Text => {}
    }

    if response.success {
        Ok(())
    } else {
        let message = response.error_message.as_deref().unwrap_or("Unknown error");
        match response.error_code {
            Some(code) => bail!("{server} returned error {code}: {message}"),
            None => bail!("{server} returned error: {message}"),
        }
    }
}
