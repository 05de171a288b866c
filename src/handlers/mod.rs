pub mod build_handlers;
pub mod health_handlers;
