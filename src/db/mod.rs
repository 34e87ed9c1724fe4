// Postgres persistence for positions and the order log
pub mod postgres;

pub use postgres::PostgresPersistence;
