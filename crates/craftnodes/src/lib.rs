//! Standard node library
//!
//! General-purpose nodes registered under well-known `uses` keys.

mod log;
mod transform;

pub use log::log_node;
pub use transform::{json_parse, json_stringify};

use craftcore::handler_fn;
use craftruntime::NodeRegistry;

/// Registers every standard node with a registry.
pub fn register_all(registry: &mut NodeRegistry) {
    registry.register_function("log", handler_fn(log_node));
    registry.register_function("json-parse", handler_fn(json_parse));
    registry.register_function("json-stringify", handler_fn(json_stringify));
}
