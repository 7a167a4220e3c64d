//! Bitcoin full-index storage and wallet-service engine: block ingest and
//! chain organization, the on-disk scripthash index, the zero-confirmation
//! acceptor, and the authenticated framed transport serving wallet
//! clients.

pub mod batch;
pub mod block_files;
pub mod broadcast;
pub mod chainwork;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod headers;
pub mod index_writer;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod node;
pub mod notifications;
pub mod organizer;
pub mod parser;
pub mod queries;
pub mod script;
pub mod sessions;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod wire;
pub mod zeroconf;

#[cfg(test)]
pub mod testutil;

#[cfg(test)]
mod reorg_tests;

#[cfg(test)]
mod transport_tests;
