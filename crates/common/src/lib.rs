pub mod address;
pub mod config;
pub mod db;
pub mod fallback;
pub mod gateway;
pub mod insights;
pub mod observability;
pub mod types;
