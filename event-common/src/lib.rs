pub mod decode;
pub mod event;
pub mod literal;
pub mod mapping;
pub mod metrics;
pub mod retry;
pub mod routing;
