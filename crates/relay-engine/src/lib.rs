//! The router engine: per-session dispatch over the shared control plane.

pub mod audit;
pub mod cache;
pub mod engine;
pub mod namespace;
pub mod selector;

pub use engine::{
    RouterEngine, TOOL_LIST_PROVIDERS, TOOL_TOOLS_CALL, TOOL_TOOLS_LIST, TOOL_TOOLS_REFRESH,
    router_tools,
};
pub use selector::{Selector, parse_selector};
