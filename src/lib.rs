pub mod auth;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod flush;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod retry;
pub mod store;
pub mod wire;
