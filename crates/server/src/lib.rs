pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod hierarchy;
pub mod persistence;
