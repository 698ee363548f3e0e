//! Event photo indexing: bib numbers and faces.
//!
//! A scan reconciles an event's photo directory with the registry and runs
//! new or changed photos through a supervised pool of extraction workers.
//! Results land in SQLite or PostgreSQL and are queried by bib number or by
//! face similarity.

pub mod config;
pub mod db;
pub mod extract;
pub mod logging;
pub mod scanner;
pub mod search;
pub mod supervisor;
pub mod worker;
