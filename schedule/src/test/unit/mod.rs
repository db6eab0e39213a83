pub mod opts_validation;
pub mod tc;
