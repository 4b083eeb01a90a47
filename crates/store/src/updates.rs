use crate::{Store, StoreResult};

impl Store {
    pub async fn insert_update(&self, version_from: &str, version_to: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO updates (version_from, version_to) VALUES (?1, ?2)
            ON CONFLICT (version_from, version_to) DO NOTHING
            "#,
        )
        .bind(version_from)
        .bind(version_to)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Version an agent running `version_from` should move to next. Several
    /// candidates step through the lowest target first.
    pub async fn next_update(&self, version_from: &str) -> StoreResult<Option<String>> {
        let target: Option<String> = sqlx::query_scalar(
            "SELECT version_to FROM updates WHERE version_from = ?1 ORDER BY version_to LIMIT 1",
        )
        .bind(version_from)
        .fetch_optional(&self.pool)
        .await?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::store;

    #[tokio::test]
    async fn lowest_target_wins() {
        let (_dir, store) = store().await;
        store.insert_update("1.0.0", "1.2.0").await.unwrap();
        store.insert_update("1.0.0", "1.1.0").await.unwrap();
        store.insert_update("1.0.0", "1.1.0").await.unwrap();

        assert_eq!(store.next_update("1.0.0").await.unwrap().as_deref(), Some("1.1.0"));
        assert_eq!(store.next_update("1.1.0").await.unwrap(), None);
    }
}
