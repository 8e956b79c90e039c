pub mod capture;
pub mod chat_log;
pub mod config_store;
pub mod fsutil;
pub mod projects;
pub mod tools;
