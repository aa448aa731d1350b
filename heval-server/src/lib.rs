//! # heval-server: encrypted model evaluation server
//!
//! Serves named, versioned models that compute on CKKS-encrypted vectors.
//! Clients (`heval-client`) send a public-only context plus a ciphertext;
//! the server evaluates and returns a ciphertext it cannot read.
//!
//! ## Components
//!
//! - **`model`**: the `Model` trait and `ModelError`
//! - **`models`**: built-in `LinearLayer`, `Polynomial` and `Fc`
//! - **`registry`**: thread-safe (name, version) → model table with lazy loading
//! - **`service`**: request validation and evaluation pipeline
//! - **`http`**: HTTP transport via `tiny_http`
//! - **`config`**: server configuration and the model manifest

pub mod config;
pub mod http;
pub mod model;
pub mod models;
pub mod registry;
pub mod service;
