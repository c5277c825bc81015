#![forbid(unsafe_code)]

pub mod app;
pub mod auth;
pub mod dispatcher;
pub mod fanout;
pub mod gateway;
pub mod handler;
pub mod health;
pub mod http;
pub mod key_store;
pub mod lifecycle;
pub mod pinger;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod toggler;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod dispatcher_tests;
