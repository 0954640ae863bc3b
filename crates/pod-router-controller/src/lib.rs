//! pod-router-controller: annotation-driven ingress routing for cluster pods.
//!
//! Watches routable pods and routing secrets, folds watch events into an
//! in-memory cache, and materializes the cache as nginx configuration that is
//! activated by signalling the colocated nginx process.

pub mod cache;
pub mod config;
pub mod controller;
pub mod kubernetes;
pub mod nginx;
pub mod routes;
