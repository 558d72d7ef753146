pub mod app;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod domain;
pub mod env_vars;
pub mod error;
pub mod inspect;
pub mod install;
pub mod output;
pub mod package_manager;
pub mod shutdown;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod tui;
pub mod uninstall;
