pub mod admin;
pub mod relay;
pub mod viewer;
