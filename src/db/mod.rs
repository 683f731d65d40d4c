//! Postgres row access for the ledger tables. Functions take any executor so callers can compose
//! them inside one transaction.

pub mod events;
pub mod invoices;
pub mod orders;
pub mod payments;
pub mod students;
pub mod tokens;
