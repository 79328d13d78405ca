//! HTTP request handlers
//!
//! - `transactions`: deposit, withdraw, send, exchange, balance, history
//! - `requests`: money request create / pay / reject / list
//! - `verification`: document submission and admin review
//! - `webhook`: payment processor callbacks
//! - `health`: liveness

pub mod health;
pub mod requests;
pub mod transactions;
pub mod verification;
pub mod webhook;

pub use health::*;
