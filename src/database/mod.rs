pub mod connection;
pub mod entities;
pub mod migrations;
#[cfg(test)]
pub mod test_utils;

pub use connection::*;

use clap::Subcommand;
use sea_orm::DatabaseConnection;
use sea_orm_migration::MigratorTrait;
use tracing::info;

use crate::errors::RepoResult;
use migrations::Migrator;

#[derive(Subcommand, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrateDirection {
    Up,
    Down,
    Fresh,
}

pub async fn migrate_database(db: &DatabaseConnection, direction: MigrateDirection) -> RepoResult<()> {
    match direction {
        MigrateDirection::Up => {
            info!("Running migrations up");
            Migrator::up(db, None).await?;
        }
        MigrateDirection::Down => {
            info!("Running migrations down");
            Migrator::down(db, None).await?;
        }
        MigrateDirection::Fresh => {
            info!("Running fresh migrations (down then up)");
            Migrator::down(db, None).await?;
            Migrator::up(db, None).await?;
        }
    }

    info!("Database migration completed");
    Ok(())
}
