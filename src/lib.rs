pub mod catalog;
pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod payments;
pub mod purchase;
pub mod repository;
pub mod webhooks;
