pub mod account;
pub mod actions;
pub mod binding;
pub mod config;
pub mod constants;
pub mod effects;
pub mod entities;
pub mod ids;
pub mod optimistic;
pub mod patch;
pub mod persist;
pub mod selectors;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod tab_state;
