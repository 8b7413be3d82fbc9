use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use keystone_core::approvals::{Directory, DirectoryUser, PortError};

use super::{parse_u8, RepositoryError};
use crate::DbPool;

/// Organization membership read from `org_user`. Inactive users are never returned.
pub struct SqlDirectory {
    pool: DbPool,
}

impl SqlDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_user(
        &self,
        org_id: &str,
        user: &DirectoryUser,
        active: bool,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO org_user (org_id, user_id, role_slug, role_level, active)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(org_id, user_id) DO UPDATE SET
                role_slug = excluded.role_slug,
                role_level = excluded.role_level,
                active = excluded.active",
        )
        .bind(org_id)
        .bind(&user.user_id)
        .bind(&user.role_slug)
        .bind(i64::from(user.role_level))
        .bind(active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn users_by_level(
        &self,
        org_id: &str,
        max_level: u8,
    ) -> Result<Vec<DirectoryUser>, PortError> {
        let rows = sqlx::query(
            "SELECT user_id, role_slug, role_level FROM org_user
             WHERE org_id = ? AND active = 1 AND role_level <= ?
             ORDER BY role_level ASC, user_id ASC",
        )
        .bind(org_id)
        .bind(i64::from(max_level))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn users_by_role_slug(
        &self,
        org_id: &str,
        role_slug: &str,
    ) -> Result<Vec<DirectoryUser>, PortError> {
        let rows = sqlx::query(
            "SELECT user_id, role_slug, role_level FROM org_user
             WHERE org_id = ? AND active = 1 AND role_slug = ?
             ORDER BY role_level ASC, user_id ASC",
        )
        .bind(org_id)
        .bind(role_slug)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.into_iter().map(user_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    async fn find_user(
        &self,
        org_id: &str,
        user_id: &str,
    ) -> Result<Option<DirectoryUser>, PortError> {
        let row = sqlx::query(
            "SELECT user_id, role_slug, role_level FROM org_user
             WHERE org_id = ? AND active = 1 AND user_id = ?",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.map(user_from_row).transpose()?)
    }
}

fn user_from_row(row: SqliteRow) -> Result<DirectoryUser, RepositoryError> {
    Ok(DirectoryUser {
        user_id: row.try_get("user_id")?,
        role_slug: row.try_get("role_slug")?,
        role_level: parse_u8("role_level", row.try_get("role_level")?)?,
    })
}

#[cfg(test)]
mod tests {
    use keystone_core::approvals::{Directory, DirectoryUser};

    use super::SqlDirectory;
    use crate::repositories::test_support::setup_pool;

    fn user(user_id: &str, role_slug: &str, role_level: u8) -> DirectoryUser {
        DirectoryUser {
            user_id: user_id.to_string(),
            role_slug: role_slug.to_string(),
            role_level,
        }
    }

    async fn seeded() -> SqlDirectory {
        let directory = SqlDirectory::new(setup_pool().await);
        for (org, entry, active) in [
            ("org-1", user("u-agent", "sales-agent", 5), true),
            ("org-1", user("u-sm", "sales-manager", 4), true),
            ("org-1", user("u-md", "managing-director", 1), true),
            ("org-1", user("u-gm", "general-manager", 2), false),
            ("org-2", user("u-md2", "managing-director", 1), true),
        ] {
            directory.upsert_user(org, &entry, active).await.expect("seed user");
        }
        directory
    }

    #[tokio::test]
    async fn level_query_is_ordered_most_senior_first_and_skips_inactive() {
        let directory = seeded().await;

        let users = directory.users_by_level("org-1", 4).await.expect("query");
        let ids: Vec<&str> = users.iter().map(|user| user.user_id.as_str()).collect();

        assert_eq!(ids, vec!["u-md", "u-sm"]);
    }

    #[tokio::test]
    async fn role_and_user_lookups_are_org_scoped() {
        let directory = seeded().await;

        let directors = directory.users_by_role_slug("org-1", "managing-director").await.expect("q");
        assert_eq!(directors, vec![user("u-md", "managing-director", 1)]);
        assert!(directory.find_user("org-2", "u-md").await.expect("find").is_none());
        assert!(directory.find_user("org-1", "u-gm").await.expect("find").is_none());
        assert_eq!(
            directory.find_user("org-1", "u-agent").await.expect("find"),
            Some(user("u-agent", "sales-agent", 5))
        );
    }

    #[tokio::test]
    async fn upsert_updates_role_in_place() {
        let directory = seeded().await;
        directory
            .upsert_user("org-1", &user("u-agent", "sales-manager", 4), true)
            .await
            .expect("promote");

        let managers = directory.users_by_role_slug("org-1", "sales-manager").await.expect("q");
        assert_eq!(managers.len(), 2);
    }
}
