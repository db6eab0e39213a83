pub mod allocator;
pub mod arena;
pub mod registry;
