pub mod jit;
pub mod store;
