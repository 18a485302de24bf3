pub mod database;
pub mod connection;
pub mod config;
pub mod auth;
pub mod users;
pub mod connections;
pub mod conversations;
pub mod groups;
pub mod admin;
pub mod notifications;
pub mod changes;
pub mod content;
pub mod websocket;
