//! HTTP surface of the gateway.
//!
//! All routes live under `/v1` behind bearer-token auth against the single
//! configured server key. Submission is asynchronous: `POST
//! /v1/chat/completions` queues the request and clients poll `GET
//! /v1/requests/{id}` for the terminal envelope.

mod auth;
mod error;
mod routes;
mod server;
mod state;

pub use {
    error::ApiError,
    server::{build_router, serve},
    state::AppState,
};
