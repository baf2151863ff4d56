pub mod health;
pub mod ledger;
pub mod transactions;
