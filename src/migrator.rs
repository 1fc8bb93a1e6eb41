use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_customers_table::Migration),
            Box::new(m20240301_000002_create_accounts_table::Migration),
            Box::new(m20240301_000003_create_cards_table::Migration),
            Box::new(m20240301_000004_create_outbox_events_table::Migration),
        ]
    }
}

mod m20240301_000001_create_customers_table {
    use sea_orm_migration::prelude::*;
    use sea_orm_migration::sea_orm::DbBackend;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_customers_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Customers::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Customers::FirstName).string().not_null())
                        .col(ColumnDef::new(Customers::LastName).string().not_null())
                        .col(ColumnDef::new(Customers::OtherName).string().null())
                        .col(
                            ColumnDef::new(Customers::DateCreated)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Customers::DateLastModified)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_customers_date_created")
                        .table(Customers::Table)
                        .col(Customers::DateCreated)
                        .to_owned(),
                )
                .await?;

            if manager.get_database_backend() == DbBackend::Postgres {
                let conn = manager.get_connection();
                conn.execute_unprepared(
                    r#"ALTER TABLE customers ADD COLUMN IF NOT EXISTS searchable tsvector
                       GENERATED ALWAYS AS (to_tsvector('simple',
                           coalesce(first_name, '') || ' ' ||
                           coalesce(last_name, '') || ' ' ||
                           coalesce(other_name, ''))) STORED"#,
                )
                .await?;
                conn.execute_unprepared(
                    "CREATE INDEX IF NOT EXISTS idx_customers_searchable ON customers USING GIN (searchable)",
                )
                .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Customers {
        Table,
        Id,
        FirstName,
        LastName,
        OtherName,
        DateCreated,
        DateLastModified,
    }
}

mod m20240301_000002_create_accounts_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_accounts_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            // customer_id is not a foreign key: customers live in another service's store
            manager
                .create_table(
                    Table::create()
                        .table(Accounts::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Accounts::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(Accounts::Iban).string_len(34).not_null())
                        .col(ColumnDef::new(Accounts::BicSwift).string_len(11).not_null())
                        .col(ColumnDef::new(Accounts::CustomerId).uuid().not_null())
                        .col(
                            ColumnDef::new(Accounts::DateCreated)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Accounts::DateLastModified)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_accounts_customer_id")
                        .table(Accounts::Table)
                        .col(Accounts::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_accounts_iban")
                        .table(Accounts::Table)
                        .col(Accounts::Iban)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Accounts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Accounts {
        Table,
        Id,
        Iban,
        BicSwift,
        CustomerId,
        DateCreated,
        DateLastModified,
    }
}

mod m20240301_000003_create_cards_table {
    use sea_orm_migration::prelude::*;
    use sea_orm_migration::sea_orm::DbBackend;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_cards_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Cards::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Cards::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Cards::Alias).string().not_null())
                        .col(ColumnDef::new(Cards::Pan).string_len(19).not_null())
                        .col(ColumnDef::new(Cards::Cvv).string_len(3).not_null())
                        .col(ColumnDef::new(Cards::CardType).string_len(16).not_null())
                        .col(ColumnDef::new(Cards::AccountId).uuid().not_null())
                        .col(
                            ColumnDef::new(Cards::DateCreated)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Cards::DateLastModified)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Lookup index only. One card per type is checked before insert,
            // so two concurrent creates of the same type can both land.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cards_account_id_card_type")
                        .table(Cards::Table)
                        .col(Cards::AccountId)
                        .col(Cards::CardType)
                        .to_owned(),
                )
                .await?;

            if manager.get_database_backend() == DbBackend::Postgres {
                let conn = manager.get_connection();
                conn.execute_unprepared(
                    r#"ALTER TABLE cards ADD COLUMN IF NOT EXISTS searchable tsvector
                       GENERATED ALWAYS AS (to_tsvector('simple', coalesce(alias, ''))) STORED"#,
                )
                .await?;
                conn.execute_unprepared(
                    "CREATE INDEX IF NOT EXISTS idx_cards_searchable ON cards USING GIN (searchable)",
                )
                .await?;
            }

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Cards::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Cards {
        Table,
        Id,
        Alias,
        Pan,
        Cvv,
        CardType,
        AccountId,
        DateCreated,
        DateLastModified,
    }
}

mod m20240301_000004_create_outbox_events_table {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_outbox_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OutboxEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OutboxEvents::Id)
                                .uuid()
                                .primary_key()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::AggregateType)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(OutboxEvents::AggregateId).uuid().not_null())
                        .col(ColumnDef::new(OutboxEvents::EventType).string().not_null())
                        .col(ColumnDef::new(OutboxEvents::Queue).string().not_null())
                        .col(ColumnDef::new(OutboxEvents::Payload).text().not_null())
                        .col(
                            ColumnDef::new(OutboxEvents::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::Attempts)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::AvailableAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(ColumnDef::new(OutboxEvents::ErrorMessage).text().null())
                        .col(
                            ColumnDef::new(OutboxEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OutboxEvents::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_outbox_events_status_available_at")
                        .table(OutboxEvents::Table)
                        .col(OutboxEvents::Status)
                        .col(OutboxEvents::AvailableAt)
                        .to_owned(),
                )
                .await?;

            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OutboxEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OutboxEvents {
        Table,
        Id,
        AggregateType,
        AggregateId,
        EventType,
        Queue,
        Payload,
        Status,
        Attempts,
        AvailableAt,
        ProcessedAt,
        ErrorMessage,
        CreatedAt,
        UpdatedAt,
    }
}
