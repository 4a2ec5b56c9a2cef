use tx2_orm::prelude::*;

#[cfg(feature = "sqlite")]
mod sqlite_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use tx2_orm::backend::{DatabaseBackend, SqlStatement};
    use tx2_orm::expr::TableRef;
    use tx2_orm::sync::RemoteSyncBackend;
    use tx2_orm::value::SqlValue;

    fn items() -> TableBlueprint {
        TableBlueprint::new("items")
            .column(Column::text("name"))
            .column(Column::integer("count").default(0))
    }

    fn items_schema() -> Schema {
        Schema::from_blueprints([items()], []).unwrap()
    }

    async fn memory_client(schema: Schema) -> Client {
        let client = Client::connect(&ClientConfig::memory(), schema).await.unwrap();
        client.push(&MigrateOptions::default()).await.unwrap();
        client
    }

    #[tokio::test]
    async fn test_insert_returns_stored_row() {
        let client = memory_client(items_schema()).await;
        let items = client.table("items").unwrap();

        let row = items.insert(values([("name", "a")])).await.unwrap();
        assert_eq!(row.get_i64("id"), Some(1));
        assert_eq!(row.get_string("name"), Some("a".to_string()));
        assert_eq!(row.get_i64("count"), Some(0));

        let fetched = items.get(col("id").eq(1)).await.unwrap().unwrap();
        assert_eq!(fetched, row);
        assert!(items.get(col("id").eq(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_table_operations() {
        let client = memory_client(items_schema()).await;
        let items = client.table("items").unwrap();

        let inserted = items
            .insert_many([
                values([("name", Value::from("a")), ("count", Value::from(1))]),
                values([("name", Value::from("b")), ("count", Value::from(2))]),
                values([("name", Value::from("b")), ("count", Value::from(4))]),
            ])
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        assert_eq!(items.count(None).await.unwrap(), 3);
        assert_eq!(items.count(Some(col("name").eq("b"))).await.unwrap(), 2);
        assert_eq!(items.sum("count", None).await.unwrap(), Value::Integer(7));
        assert_eq!(items.max("count", None).await.unwrap(), Value::Integer(4));
        assert!(items.exists(col("count").gt(3)).await.unwrap());
        assert!(!items.exists(col("count").gt(10)).await.unwrap());

        let page = items
            .many(ManyOptions::new().order_desc(col("count")).limit(2))
            .await
            .unwrap();
        let counts: Vec<i64> = page.iter().filter_map(|r| r.get_i64("count")).collect();
        assert_eq!(counts, vec![4, 2]);

        let groups = items
            .group_by(&["name"], [count().alias("n")], None)
            .await
            .unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].get_string("name"), Some("b".to_string()));
        assert_eq!(groups[1].get_i64("n"), Some(2));

        let updated = items
            .update(values([("count", 10)]), col("name").eq("b"))
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let deleted = items.delete(col("count").eq(10)).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(items.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("items")
                .column(Column::text("name").unique())
                .column(Column::integer("count").default(0))],
            [],
        )
        .unwrap();
        let client = memory_client(schema).await;
        let items = client.table("items").unwrap();

        let first = items
            .upsert(values([("name", Value::from("a")), ("count", Value::from(1))]), &["name"])
            .await
            .unwrap()
            .unwrap();
        let second = items
            .upsert(values([("name", Value::from("a")), ("count", Value::from(5))]), &["name"])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.get_i64("id"), second.get_i64("id"));
        assert_eq!(second.get_i64("count"), Some(5));
        assert_eq!(items.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scalar_query_on_empty_table() {
        let client = memory_client(items_schema()).await;
        let rows = client
            .query(|t| {
                let items = t.table("items");
                Select::from(&items).select([count()])
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].as_scalar(), Some(&Value::Integer(0)));
    }

    #[tokio::test]
    async fn test_adding_unique_rebuilds_and_keeps_rows() {
        let backend: Arc<dyn DatabaseBackend> = Arc::new(SqliteBackend::memory().await.unwrap());

        let v1 = Client::from_shared(backend.clone(), items_schema());
        v1.push(&MigrateOptions::default()).await.unwrap();
        v1.table("items")
            .unwrap()
            .insert(values([("name", Value::from("a")), ("count", Value::from(3))]))
            .await
            .unwrap();

        let v2_schema = Schema::from_blueprints(
            [TableBlueprint::new("items")
                .column(Column::text("name").unique())
                .column(Column::integer("count").default(0))],
            [],
        )
        .unwrap();
        let v2 = Client::from_shared(backend, v2_schema);

        let plan = v2.diff(&v2.introspect().await.unwrap()).unwrap();
        assert!(plan.requires_rebuild());
        let err = v2.migrate(&plan, &MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrmError::MigrationConflict(_)));

        v2.push(&MigrateOptions::destructive()).await.unwrap();

        let row = v2.table("items").unwrap().get(col("name").eq("a")).await.unwrap().unwrap();
        assert_eq!(row.get_i64("count"), Some(3));

        // The live schema now matches the declared one.
        let again = v2.diff(&v2.introspect().await.unwrap()).unwrap();
        assert!(again.is_empty(), "unexpected plan: {}", again.to_sql());

        let dup = v2.table("items").unwrap().insert(values([("name", "a")])).await;
        assert!(matches!(dup, Err(OrmError::Execution { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_bulk_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::file(dir.path().join("orm.db"));
        let client = Arc::new(Client::connect(&config, items_schema()).await.unwrap());
        client.push(&MigrateOptions::default()).await.unwrap();

        let mut handles = Vec::new();
        for worker in 0..2 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let rows: Vec<_> = (0..500)
                    .map(|i| values([("name", Value::from(format!("{}-{}", worker, i)))]))
                    .collect();
                client.table("items")?.insert_many(rows).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 500);
        }

        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 1000);
    }

    #[test]
    fn test_full_text_table_needs_columns() {
        let err = Schema::from_blueprints(
            [TableBlueprint::new("docs").column(Column::text("body"))],
            [FtsBlueprint::new("docs_fts").content("docs")],
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::SchemaValidation(_)));
    }

    #[tokio::test]
    async fn test_full_text_search() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("docs")
                .column(Column::text("title"))
                .column(Column::text("body"))],
            [FtsBlueprint::new("docs_fts").columns(["title", "body"]).content("docs")],
        )
        .unwrap();
        let client = memory_client(schema).await;
        let docs = client.table("docs").unwrap();
        docs.insert(values([("title", "sqlite"), ("body", "embedded engine")]))
            .await
            .unwrap();
        let second = docs
            .insert(values([("title", "tokio"), ("body", "async runtime")]))
            .await
            .unwrap();

        let fts = TableRef::new("docs_fts");
        let hits = client
            .select(&Select::from(&fts).select([fts.col("rowid")]).filter(fts.matches("runtime")))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].as_scalar().and_then(Value::as_i64), second.get_i64("id"));

        // Triggers keep the index in step with deletes.
        docs.delete(col("id").eq(second.get_i64("id").unwrap())).await.unwrap();
        let hits = client
            .select(&Select::from(&fts).select([fts.col("rowid")]).filter(fts.matches("runtime")))
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("items").column(Column::text("name").unique())],
            [],
        )
        .unwrap();
        let client = memory_client(schema).await;

        let err = client
            .batch_with(|batch| {
                let mut items = batch.table("items")?;
                items.insert(values([("name", "a")]))?;
                items.insert(values([("name", "a")]))?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Execution { .. }));
        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 0);

        let mut batch = client.batch();
        batch.table("items").unwrap().insert(values([("name", "a")])).unwrap();
        batch.table("items").unwrap().insert(values([("name", "b")])).unwrap();
        assert_eq!(batch.len(), 2);
        batch.commit().await.unwrap();
        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_transaction_commit_and_rollback() {
        let client = memory_client(items_schema()).await;

        let mut tx = client.begin().await.unwrap();
        tx.table("items").unwrap().insert(values([("name", "a")])).await.unwrap();
        assert_eq!(tx.table("items").unwrap().count(None).await.unwrap(), 1);
        tx.rollback().await.unwrap();
        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 0);

        let mut tx = client.begin().await.unwrap();
        tx.table("items").unwrap().insert(values([("name", "b")])).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reads_proceed_while_transaction_is_open() {
        let client = memory_client(items_schema()).await;
        client.table("items").unwrap().insert(values([("name", "a")])).await.unwrap();

        let mut tx = client.begin().await.unwrap();
        tx.table("items").unwrap().insert(values([("name", "b")])).await.unwrap();
        let count = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            client.table("items").unwrap().count(None),
        )
        .await
        .expect("read waited for the open transaction");
        assert!(count.is_ok());
        tx.rollback().await.unwrap();

        assert_eq!(client.table("items").unwrap().count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_sync_replays_writes() {
        let local = SqliteBackend::memory().await.unwrap();
        let remote = SqliteBackend::memory().await.unwrap();
        let sync = Arc::new(RemoteSyncBackend::new(local, remote));
        let client = Client::from_shared(sync.clone(), items_schema());

        client.push(&MigrateOptions::default()).await.unwrap();
        client.table("items").unwrap().insert(values([("name", "a")])).await.unwrap();
        assert_eq!(sync.pending().await, 2);

        let report = sync.sync().await.unwrap();
        assert_eq!(report.entries, 2);
        assert_eq!(sync.pending().await, 0);

        let rows = sync
            .remote()
            .query(&SqlStatement::new("SELECT name FROM items"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec![SqlValue::Text("a".to_string())]);
    }

    #[tokio::test]
    async fn test_prepare() {
        let client = memory_client(items_schema()).await;
        client.prepare("SELECT name FROM items").await.unwrap();
        assert!(client.prepare("SELECT nope FROM items").await.is_err());
        assert!(client.prepare("SELEC 1").await.is_err());
    }

    #[tokio::test]
    async fn test_typed_columns_round_trip() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("events")
                .column(Column::json("payload"))
                .column(Column::boolean("active").default(true))
                .column(Column::date("seen"))],
            [],
        )
        .unwrap();
        let client = memory_client(schema).await;
        let seen = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let row = client
            .table("events")
            .unwrap()
            .insert(values([
                ("payload", Value::from(json!({"kind": "click", "n": 2}))),
                ("seen", Value::from(seen)),
            ]))
            .await
            .unwrap();

        assert_eq!(row.get_json("payload"), Some(&json!({"kind": "click", "n": 2})));
        assert_eq!(row.get_bool("active"), Some(true));
        assert_eq!(row.get_date("seen"), Some(seen));
    }

    #[tokio::test]
    async fn test_malformed_date_text_is_rejected_before_writing() {
        let schema = Schema::from_blueprints(
            [TableBlueprint::new("events").column(Column::date("seen"))],
            [],
        )
        .unwrap();
        let client = memory_client(schema).await;
        let events = client.table("events").unwrap();

        let err = events.insert(values([("seen", "yesterday")])).await.unwrap_err();
        assert!(matches!(err, OrmError::TypeConversion(_)));
        let err = events
            .insert_many([values([("seen", "yesterday")]), values([("seen", "today")])])
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::TypeConversion(_)));
        assert!(events.many(ManyOptions::new()).await.unwrap().is_empty());

        // RFC 3339 text is stored in normalized UTC form.
        let row = events
            .insert(values([("seen", "2023-11-14T23:13:20+01:00")]))
            .await
            .unwrap();
        assert_eq!(row.get_date("seen"), Utc.timestamp_opt(1_700_000_000, 0).single());
        assert_eq!(events.many(ManyOptions::new()).await.unwrap().len(), 1);
    }
}
