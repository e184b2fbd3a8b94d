//! # Storage Rollup
//!
//! Incremental, resumable storage-usage rollups over a deduplicated file
//! inventory.
//!
//! A site stores each distinct piece of content once and references it from
//! many places. This crate attributes that content to the users, courses and
//! categories that reference it, separating what an owner shares with others
//! from what only it holds, and publishes the totals as a snapshot. Work is
//! split into bounded steps so a scheduler can drive it a little at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────────┐   ┌─────────────┐
//! │  Inventory  │──▶│  storage-rollup-core      │──▶│ Checkpoints │
//! │  (SQLite)   │   │  map ▶ aggregate ▶ publish│   │  (SQLite)   │
//! └─────────────┘   └──────────────────────────┘   └──────┬──────┘
//!                                                         │
//!                                          ┌──────────────┤
//!                                          ▼              ▼
//!                                     ┌─────────┐   ┌──────────┐
//!                                     │ status  │   │  export  │
//!                                     └─────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rollup init                 # create the checkpoint database
//! rollup run                  # run a full cycle
//! rollup status               # show totals and the heaviest users
//! rollup export courses       # JSON for other tools
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`sqlite_store`] | SQLite fact source and checkpoint store |
//! | [`runner`] | Step / cycle / purge commands |
//! | [`progress`] | Step progress reporting |
//! | [`status`] | Status and usage report |
//! | [`export`] | JSON export of published results |

pub mod config;
pub mod db;
pub mod export;
pub mod migrate;
pub mod progress;
pub mod runner;
pub mod sqlite_store;
pub mod status;
