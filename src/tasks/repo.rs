use sqlx::{PgPool, QueryBuilder};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::tasks::repo_types::{Priority, Status, Task};

const TASK_COLUMNS: &str = "id, user_id, title, description, due_date, status, completed, \
     priority, tags, file, created_at, updated_at";

/// Fields of a new task; defaults beyond these live in the schema.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub due_date: Option<OffsetDateTime>,
    pub status: Option<Status>,
    pub completed: Option<bool>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    pub file: Option<String>,
}

/// Partial update; `None` keeps the stored value (merge, not replace).
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub due_date: Option<OffsetDateTime>,
    pub status: Option<Status>,
    pub completed: Option<bool>,
    pub priority: Option<Priority>,
    pub tags: Option<Vec<String>>,
    pub file: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub completed: Option<bool>,
}

impl Task {
    pub async fn create(db: &PgPool, owner: Uuid, new: NewTask) -> anyhow::Result<Task> {
        let sql = format!(
            "INSERT INTO tasks (user_id, title, description, due_date, status, completed, \
             priority, tags, file) \
             VALUES ($1, $2, COALESCE($3, 'No description'), COALESCE($4, now()), \
             COALESCE($5, 'active'), COALESCE($6, FALSE), COALESCE($7, 'low'), \
             COALESCE($8, '{{}}'), $9) \
             RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(owner)
            .bind(&new.title)
            .bind(new.description.as_deref())
            .bind(new.due_date)
            .bind(new.status)
            .bind(new.completed)
            .bind(new.priority)
            .bind(new.tags.as_deref())
            .bind(new.file.as_deref())
            .fetch_one(db)
            .await?;
        Ok(task)
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(db)
            .await?;
        Ok(task)
    }

    /// Owner-scoped page. Filters combine with AND.
    pub async fn list_by_owner(
        db: &PgPool,
        owner: Uuid,
        filter: &TaskFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<Task>> {
        let mut qb =
            QueryBuilder::new(format!("SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = "));
        qb.push_bind(owner);
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC");
        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);
        let tasks = qb.build_query_as::<Task>().fetch_all(db).await?;
        Ok(tasks)
    }

    pub async fn count_by_owner(
        db: &PgPool,
        owner: Uuid,
        filter: &TaskFilter,
    ) -> anyhow::Result<i64> {
        let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM tasks WHERE user_id = ");
        qb.push_bind(owner);
        push_filter(&mut qb, filter);
        let total = qb.build_query_scalar::<i64>().fetch_one(db).await?;
        Ok(total)
    }

    /// Everything a user owns; used by the elevated profile view.
    pub async fn all_by_owner(db: &PgPool, owner: Uuid) -> anyhow::Result<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE user_id = $1 ORDER BY created_at DESC"
        );
        let tasks = sqlx::query_as::<_, Task>(&sql)
            .bind(owner)
            .fetch_all(db)
            .await?;
        Ok(tasks)
    }

    /// Merge-not-replace: each COALESCE keeps the stored value when the
    /// patch field is absent. The owner column is never touched.
    pub async fn update_partial(db: &PgPool, id: Uuid, patch: TaskPatch) -> anyhow::Result<Task> {
        let sql = format!(
            "UPDATE tasks SET \
             title = COALESCE($2, title), \
             description = COALESCE($3, description), \
             due_date = COALESCE($4, due_date), \
             status = COALESCE($5, status), \
             completed = COALESCE($6, completed), \
             priority = COALESCE($7, priority), \
             tags = COALESCE($8, tags), \
             file = COALESCE($9, file), \
             updated_at = now() \
             WHERE id = $1 RETURNING {TASK_COLUMNS}"
        );
        let task = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(patch.title.as_deref())
            .bind(patch.description.as_deref())
            .bind(patch.due_date)
            .bind(patch.status)
            .bind(patch.completed)
            .bind(patch.priority)
            .bind(patch.tags.as_deref())
            .bind(patch.file.as_deref())
            .fetch_one(db)
            .await?;
        Ok(task)
    }

    pub async fn delete_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<bool> {
        let res = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Bulk removal of everything the owner has, in one statement. Other
    /// users' tasks are untouched by construction.
    pub async fn delete_all_by_owner(db: &PgPool, owner: Uuid) -> anyhow::Result<u64> {
        let res = sqlx::query("DELETE FROM tasks WHERE user_id = $1")
            .bind(owner)
            .execute(db)
            .await?;
        Ok(res.rows_affected())
    }
}

fn push_filter<'a>(qb: &mut QueryBuilder<'a, sqlx::Postgres>, filter: &'a TaskFilter) {
    if let Some(priority) = filter.priority {
        qb.push(" AND priority = ").push_bind(priority);
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }
    if let Some(completed) = filter.completed {
        qb.push(" AND completed = ").push_bind(completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::repo_types::User;

    fn titled(title: &str) -> NewTask {
        NewTask {
            title: title.into(),
            description: None,
            due_date: None,
            status: None,
            completed: None,
            priority: None,
            tags: None,
            file: None,
        }
    }

    async fn make_user(pool: &PgPool, email: &str) -> User {
        User::create(pool, "Test", email, "hash").await.unwrap()
    }

    #[sqlx::test]
    async fn partial_update_merges_and_keeps_owner(pool: PgPool) {
        let owner = make_user(&pool, "owner@example.com").await;
        let task = Task::create(
            &pool,
            owner.id,
            NewTask {
                description: Some("keep me".into()),
                ..titled("Original")
            },
        )
        .await
        .unwrap();

        let patched = Task::update_partial(
            &pool,
            task.id,
            TaskPatch {
                title: Some("Renamed".into()),
                completed: Some(true),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(patched.title, "Renamed");
        assert!(patched.completed);
        assert_eq!(patched.description, "keep me");
        assert_eq!(patched.user_id, owner.id);
    }

    #[sqlx::test]
    async fn delete_all_only_touches_the_owner(pool: PgPool) {
        let a = make_user(&pool, "a@example.com").await;
        let b = make_user(&pool, "b@example.com").await;
        for i in 0..3 {
            Task::create(&pool, a.id, titled(&format!("a{i}")))
                .await
                .unwrap();
        }
        for i in 0..2 {
            Task::create(&pool, b.id, titled(&format!("b{i}")))
                .await
                .unwrap();
        }

        let deleted = Task::delete_all_by_owner(&pool, a.id).await.unwrap();
        assert_eq!(deleted, 3);

        let filter = TaskFilter::default();
        assert_eq!(Task::count_by_owner(&pool, a.id, &filter).await.unwrap(), 0);
        assert_eq!(Task::count_by_owner(&pool, b.id, &filter).await.unwrap(), 2);
    }

    #[sqlx::test]
    async fn listing_pages_through_fifteen_rows(pool: PgPool) {
        let owner = make_user(&pool, "owner@example.com").await;
        for i in 0..15 {
            Task::create(&pool, owner.id, titled(&format!("task {i}")))
                .await
                .unwrap();
        }

        let filter = TaskFilter::default();
        let total = Task::count_by_owner(&pool, owner.id, &filter).await.unwrap();
        assert_eq!(total, 15);

        let first = Task::list_by_owner(&pool, owner.id, &filter, 10, 0)
            .await
            .unwrap();
        let second = Task::list_by_owner(&pool, owner.id, &filter, 10, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(second.len(), 5);
        assert!(first.iter().all(|t| second.iter().all(|s| s.id != t.id)));
    }
}
