//! Client for the URUK ticket lottery: spend an ERC20-style token on
//! tickets (approving an allowance first when needed), track the
//! purchase through confirmation, and keep a round countdown honest
//! against the contract, the backend, and a static fallback.

pub mod allowance;

pub mod app;

pub mod backend_client;

pub mod clock;

pub mod config;

pub mod gateway;

pub mod orchestrator;

pub mod quantity;

pub mod refresh;

pub mod test_helpers;
