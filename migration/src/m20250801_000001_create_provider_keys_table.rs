use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProviderKeys::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(ProviderKeys::Provider).text().not_null())
                    .col(ColumnDef::new(ProviderKeys::KeyHash).text().not_null())
                    .col(ColumnDef::new(ProviderKeys::Model).text().not_null())
                    .col(ColumnDef::new(ProviderKeys::KeyValue).text().not_null())
                    .col(
                        ColumnDef::new(ProviderKeys::Status)
                            .text()
                            .not_null()
                            .default("unchecked"),
                    )
                    .col(ColumnDef::new(ProviderKeys::Reason).text())
                    .col(
                        ColumnDef::new(ProviderKeys::PenaltyUntil)
                            .timestamp_with_time_zone(),
                    )
                    .col(
                        ColumnDef::new(ProviderKeys::LastCheckedAt)
                            .timestamp_with_time_zone(),
                    )
                    .primary_key(
                        Index::create()
                            .col(ProviderKeys::Provider)
                            .col(ProviderKeys::KeyHash)
                            .col(ProviderKeys::Model),
                    )
                    .to_owned(),
            )
            .await?;

        // 创建索引
        manager
            .create_index(
                Index::create()
                    .name("idx_provider_keys_provider_model_status")
                    .table(ProviderKeys::Table)
                    .col(ProviderKeys::Provider)
                    .col(ProviderKeys::Model)
                    .col(ProviderKeys::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_provider_keys_penalty_until")
                    .table(ProviderKeys::Table)
                    .col(ProviderKeys::PenaltyUntil)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ProviderKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProviderKeys {
    Table,
    Provider,
    KeyHash,
    Model,
    KeyValue,
    Status,
    Reason,
    PenaltyUntil,
    LastCheckedAt,
}
