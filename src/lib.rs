// ABOUTME: Library crate for tmux-agentic exposing the MCP client for the binary and tests

#![allow(missing_docs)]

pub mod logging;
pub mod mcp_client;
