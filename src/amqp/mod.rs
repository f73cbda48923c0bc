//! Helpers for connecting to a rabbitmq broker

mod channel;
pub mod configuration;
mod factory;
pub use factory::ConnectionFactory;
