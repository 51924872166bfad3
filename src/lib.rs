pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod greeter;
pub mod handler;
pub mod logger;
pub mod page;
pub mod rpc;
pub mod worker;

pub use error::{GreetError, Result};
