pub mod cache;
pub mod coordinator;
pub mod daykey;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod repository;
pub mod service;
pub mod sink;

#[cfg(test)]
mod testing;
