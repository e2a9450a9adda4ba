pub mod agent;
pub mod api;
pub mod constants;
pub mod controller;
pub mod error;
pub mod utils;
