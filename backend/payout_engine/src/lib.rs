//! Payout execution engine.
//!
//! Owed transfers are recorded as [`payout::Payout`] rows, claimed once,
//! executed against the Stellar network and retried with exponential backoff
//! until they complete or fail for good.
//!
//! | Component                     | Module            |
//! |-------------------------------|-------------------|
//! | Payout record + state machine | [`payout`]        |
//! | Record store                  | [`store`], [`db`] |
//! | Ledger network client         | [`ledger`]        |
//! | Transaction executor          | [`executor`]      |
//! | Claim handler                 | [`claim`]         |
//! | Execution orchestrator        | [`orchestrator`]  |
//! | Retry scheduler               | [`scheduler`]     |
//! | Admin surface                 | [`service`], [`api`] |

pub mod api;
pub mod claim;
pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod executor;
pub mod ledger;
pub mod orchestrator;
pub mod payout;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod testutil;
