pub mod db;
pub mod migration;

pub use db::{Column, DbBatch, DbStorage};
pub use migration::{apply_migrations, default_migrations, Migration};
