pub mod config;
pub mod error;
pub mod profile_repository;
pub mod session_store;
pub mod storage;
