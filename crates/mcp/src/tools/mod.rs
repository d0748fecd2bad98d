pub mod calculator;
mod registry;

pub use registry::{json_schema_number, json_schema_object, json_schema_string, Tool, ToolRegistry};
