//! MCP (Model Context Protocol) clients.
//!
//! Tools can live in an external stdio subprocess or on the connected
//! device itself, reached through the session's own frame connection.

pub mod device;
pub mod manager;
pub mod protocol;
pub mod stdio;
