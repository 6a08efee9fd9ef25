pub mod arena;
pub mod registry;
pub mod spec;
