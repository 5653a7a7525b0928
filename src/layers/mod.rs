pub mod mcp;
pub mod service;
