pub mod api;
pub mod auth;
pub mod capture;
pub mod extraction;
pub mod lifecycle;
pub mod live;
pub mod models;
pub mod persist;
pub mod recipe;
pub mod recurrence;
pub mod scope;
pub mod settings;
pub mod staging;
pub mod store;
pub mod sweep;
pub mod triage;
pub mod world;
