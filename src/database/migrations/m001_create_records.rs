use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Records::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Records::TypeName).string().not_null())
                    .col(ColumnDef::new(Records::RecordKey).string().not_null())
                    .col(ColumnDef::new(Records::TenantId).string())
                    .col(
                        ColumnDef::new(Records::IsDeleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Records::Version).big_integer().not_null())
                    .col(ColumnDef::new(Records::Data).text().not_null())
                    .col(ColumnDef::new(Records::UpdatedAt).timestamp().not_null())
                    .primary_key(
                        Index::create()
                            .col(Records::TypeName)
                            .col(Records::RecordKey),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_records_type_tenant")
                    .table(Records::Table)
                    .col(Records::TypeName)
                    .col(Records::TenantId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Sequences::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sequences::Name)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sequences::Value).big_integer().not_null())
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Sequences::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Records::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Records {
    Table,
    TypeName,
    RecordKey,
    TenantId,
    IsDeleted,
    Version,
    Data,
    UpdatedAt,
}

#[derive(Iden)]
enum Sequences {
    Table,
    Name,
    Value,
}
