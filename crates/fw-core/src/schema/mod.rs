//! On-disk schema of the todo file
//!
//! Records preserve unknown JSON fields so a newer writer's data survives a
//! load/save cycle through an older reader.

mod document;
mod todo;

pub use document::{
    DecodedDocument, JsonFormat, PRETTY_THRESHOLD, SCHEMA_VERSION, SchemaError, decode, encode,
};
pub use todo::{Todo, next_id};
