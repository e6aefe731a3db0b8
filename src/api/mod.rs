//! HTTP API: server, routes, DTOs, and artifact delivery.

pub mod error;
pub mod models;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod stream;
