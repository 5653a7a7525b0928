//! Wallet and network plumbing for an on-chain chat client.
//!
//! `implementations` holds the components (network guard, session wallet
//! activation, contract connector); `layers` exposes them as operations over a
//! JSON-RPC stdio surface.

pub mod chains;
pub mod config;
pub mod error;
pub mod implementations;
pub mod layers;
pub mod notice;
pub mod storage;
pub mod types;
pub mod wallet;
