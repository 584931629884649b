//! Application layer: the engine and what it needs to run steps

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod health;
pub mod mapping;
pub mod memo;
pub mod observer;
pub mod script;
pub mod webhook;
