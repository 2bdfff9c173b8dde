pub mod agent;
pub mod cli;
pub mod event;
pub mod mysql;
pub mod qan;
pub mod query;
pub mod slowlog;
pub mod ticker;
