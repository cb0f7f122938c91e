//! Reconciliation Service - matches imported bank transactions against expected payments.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
