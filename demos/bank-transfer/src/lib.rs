//! Bank transfer demo for the Sequent engine.
//!
//! Accounts are event-sourced aggregates: each command rebuilds the account
//! from the event log, decides one event, and commits it. Committed records
//! flow through the event processor into a [`BalanceProjection`], one account
//! at a time and in version order.

pub mod account;
pub mod projection;

pub use account::{ACCOUNT_TYPE, Account, AccountCommand, AccountEvent, AccountHandler};
pub use projection::BalanceProjection;
