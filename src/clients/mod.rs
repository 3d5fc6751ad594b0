pub mod api;
pub mod rabbitmq;
pub mod smtp;
pub mod token;
