//! Database drivers implementing the core collaborator traits.
//!
//! - [`mysql`]: recorder source reader over SQLx
//! - [`postgres`]: target writer over deadpool-postgres with rustls

pub mod mysql;
pub mod postgres;

pub use mysql::MysqlReader;
pub use postgres::{PostgresWriter, SslMode};
