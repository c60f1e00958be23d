//! MySQL/MariaDB source driver.
//!
//! Supports MySQL 5.7+, 8.0+ and MariaDB 10.3+, the versions the recorder
//! runs on. Connections are made through SQLx with TLS preferred and the
//! session time zone pinned to UTC.

mod reader;

pub use reader::MysqlReader;
