pub mod clients;
pub mod config;
pub mod controller;
pub mod error;
pub mod external;
pub mod gateway;
pub mod http;
pub mod job;
pub mod labels;
pub mod listing;
pub mod logs;
pub mod resources;
pub mod staging;
pub mod status;
