//! Durable storage for `database` mode.
//!
//! Grounded on the teacher's own `rusqlite` + `r2d2` + `r2d2_sqlite` stack
//! (already present for its lifestats/cortex subsystem) and its pattern of
//! hand-issuing idempotent `CREATE TABLE IF NOT EXISTS` statements rather
//! than a versioned migration engine — schema migrations are out of scope
//! here, so no migration framework is added.

pub mod sqlite;
