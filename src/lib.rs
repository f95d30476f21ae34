//! Tutorbook - Booking and settlement core for a peer-tutoring marketplace
//!
//! This library provides session booking, payment authorization through the
//! processor, dual confirmation, tutor payouts and cancellation refunds.

pub mod api;
pub mod config;
pub mod db;
pub mod models;
pub mod payments;
pub mod services;
