pub mod models;

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod routes;
pub mod services;
pub mod state;
pub mod utils;

#[cfg(test)]
mod test_support;
