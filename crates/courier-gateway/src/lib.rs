pub mod broker;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
