//! A small distributed MapReduce engine.
//!
//! One master splits a SQLite-backed input relation into shards, hands map
//! and reduce tasks to polling workers over RPC, and merges the reduce
//! outputs into a single result. Workers exchange intermediate files over
//! embedded read-only HTTP servers.

pub mod mr;
