//! Context assembly for cell invocations

mod builder;

pub use builder::ContextBuilder;
