//! SQLite-backed [`HierarchySource`].
//!
//! Every write unit runs in one sqlx transaction. Cancellation drops the unit's future, and
//! with it the uncommitted transaction, so a cancelled rewrite rolls back entirely.

use sqlx::{
    error::BoxDynError,
    migrate::{MigrateDatabase, Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions},
    ConnectOptions, Pool, QueryBuilder, Row,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    path::PathBuf,
    pin::Pin,
    str::FromStr,
};

use crate::{
    cache::CacheVariantKey,
    cancel::Cancel,
    counts::ElementCounter,
    error::ArborError,
    paths::path,
    properties::{EntityId, HierarchicalEntity, LocalizedValue},
    source::{HierarchySource, PathRewrite},
};

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    id: i64,
    tree: String,
    parent_id: Option<i64>,
    tree_path: String,
    display_order: i32,
    published: bool,
    deleted: bool,
    name: String,
    alias: Option<String>,
    external_link: Option<String>,
    media_file_id: Option<i64>,
    badge_text: Option<String>,
    badge_style: i32,
    limited_to_stores: bool,
    subject_to_acl: bool,
}

impl From<NodeRow> for HierarchicalEntity {
    fn from(row: NodeRow) -> Self {
        HierarchicalEntity {
            id: row.id as EntityId,
            tree: row.tree,
            parent_id: row.parent_id.map(|p| p as EntityId),
            tree_path: row.tree_path,
            display_order: row.display_order,
            published: row.published,
            deleted: row.deleted,
            name: row.name,
            alias: row.alias,
            external_link: row.external_link,
            media_file_id: row.media_file_id.map(|m| m as u64),
            badge_text: row.badge_text,
            badge_style: row.badge_style,
            limited_to_stores: row.limited_to_stores,
            store_ids: BTreeSet::new(),
            subject_to_acl: row.subject_to_acl,
            role_ids: BTreeSet::new(),
        }
    }
}

const NODE_COLUMNS: &str = "id, tree, parent_id, tree_path, display_order, published, deleted, \
    name, alias, external_link, media_file_id, badge_text, badge_style, limited_to_stores, \
    subject_to_acl";

/// Run `work` unless `cancel` fires first. Dropping `work` drops its open transaction.
async fn cancellable<R, F>(cancel: &Cancel, work: F) -> Result<R, ArborError>
where
    F: Future<Output = Result<R, ArborError>>,
{
    cancel.check()?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::warn!("Write unit cancelled before commit; rolling back");
            Err(ArborError::OperationCancelled)
        }
        res = work => res,
    }
}

impl DbConnection {
    /// Attach store and role ids to rows. `tree` scopes the lookup; `None` loads by row id.
    async fn attach_mappings(
        &self,
        rows: &mut [HierarchicalEntity],
        tree: Option<&str>,
    ) -> Result<(), ArborError> {
        if rows.is_empty() {
            return Ok(());
        }
        for (table, column) in [("store_mappings", "store_id"), ("acl_records", "role_id")] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT m.entity_id, m.{column} FROM {table} m JOIN tree_nodes n ON n.id = m.entity_id WHERE "
            ));
            match tree {
                Some(tree) => {
                    qb.push("n.tree = ").push_bind(tree.to_string());
                }
                None => {
                    qb.push("n.id IN (");
                    let mut sep = qb.separated(", ");
                    for row in rows.iter() {
                        sep.push_bind(row.id as i64);
                    }
                    qb.push(")");
                }
            }
            let pairs = qb
                .build_query_as::<(i64, i64)>()
                .fetch_all(&self.0)
                .await?;
            let mut grouped: BTreeMap<EntityId, BTreeSet<u32>> = BTreeMap::new();
            for (entity_id, target) in pairs {
                grouped
                    .entry(entity_id as EntityId)
                    .or_default()
                    .insert(target as u32);
            }
            for row in rows.iter_mut() {
                let ids = grouped.remove(&row.id).unwrap_or_default();
                match column {
                    "store_id" => row.store_ids = ids,
                    _ => row.role_ids = ids,
                }
            }
        }
        Ok(())
    }

    /// Write every column of `entity` and replace its mappings, exactly as given. Paths are
    /// not validated, so repair tooling and fixtures can describe corrupt data.
    #[tracing::instrument(skip(self, entity), fields(id = entity.id))]
    pub async fn save_node(&self, entity: &HierarchicalEntity) -> Result<(), ArborError> {
        let mut tx = self.0.begin().await?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO tree_nodes ({NODE_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(entity.id as i64)
        .bind(&entity.tree)
        .bind(entity.parent_id.map(|p| p as i64))
        .bind(&entity.tree_path)
        .bind(entity.display_order)
        .bind(entity.published)
        .bind(entity.deleted)
        .bind(&entity.name)
        .bind(&entity.alias)
        .bind(&entity.external_link)
        .bind(entity.media_file_id.map(|m| m as i64))
        .bind(&entity.badge_text)
        .bind(entity.badge_style)
        .bind(entity.limited_to_stores)
        .bind(entity.subject_to_acl)
        .execute(&mut *tx)
        .await?;
        Self::replace_mappings(&mut tx, entity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_mappings(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        entity: &HierarchicalEntity,
    ) -> Result<(), ArborError> {
        for (table, column, ids) in [
            ("store_mappings", "store_id", &entity.store_ids),
            ("acl_records", "role_id", &entity.role_ids),
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE entity_id = ?"))
                .bind(entity.id as i64)
                .execute(&mut **tx)
                .await?;
            if ids.is_empty() {
                continue;
            }
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO {table} (entity_id, {column}) "
            ));
            qb.push_values(ids.iter(), |mut b, id| {
                b.push_bind(entity.id as i64).push_bind(*id as i64);
            });
            qb.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    pub async fn set_localized(&self, value: &LocalizedValue) -> Result<(), ArborError> {
        match &value.value {
            Some(text) => {
                sqlx::query(
                    "INSERT OR REPLACE INTO localized_properties \
                     (entity_id, tree, language_id, key, value) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(value.entity_id as i64)
                .bind(&value.tree)
                .bind(value.language_id as i64)
                .bind(&value.key)
                .bind(text)
                .execute(&self.0)
                .await?;
            }
            None => {
                sqlx::query(
                    "DELETE FROM localized_properties \
                     WHERE entity_id = ? AND language_id = ? AND key = ?",
                )
                .bind(value.entity_id as i64)
                .bind(value.language_id as i64)
                .bind(&value.key)
                .execute(&self.0)
                .await?;
            }
        }
        Ok(())
    }

    pub async fn add_membership(&self, entity_id: EntityId, item_id: u64) -> Result<(), ArborError> {
        sqlx::query("INSERT OR IGNORE INTO memberships (entity_id, item_id) VALUES (?, ?)")
            .bind(entity_id as i64)
            .bind(item_id as i64)
            .execute(&self.0)
            .await?;
        Ok(())
    }

    pub async fn trees(&self) -> Result<Vec<String>, ArborError> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT DISTINCT tree FROM tree_nodes ORDER BY tree")
            .fetch_all(&self.0)
            .await?;
        Ok(rows.into_iter().map(|(tree,)| tree).collect())
    }
}

impl HierarchySource for DbConnection {
    async fn find_by_id(&self, id: EntityId) -> Result<Option<HierarchicalEntity>, ArborError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM tree_nodes WHERE id = ?"
        ))
        .bind(id as i64)
        .fetch_optional(&self.0)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut rows = [HierarchicalEntity::from(row)];
        self.attach_mappings(&mut rows, None).await?;
        let [entity] = rows;
        Ok(Some(entity))
    }

    /// One recursive query, bounded by `max_depth` so a stored cycle terminates.
    async fn find_ancestor_chain(
        &self,
        id: EntityId,
        max_depth: usize,
    ) -> Result<Vec<(EntityId, Option<EntityId>)>, ArborError> {
        let rows = sqlx::query(
            "WITH RECURSIVE chain(id, parent_id, depth) AS ( \
                SELECT id, parent_id, 1 FROM tree_nodes WHERE id = ? \
                UNION ALL \
                SELECT n.id, n.parent_id, c.depth + 1 FROM tree_nodes n \
                JOIN chain c ON n.id = c.parent_id WHERE c.depth < ? \
             ) SELECT id, parent_id FROM chain ORDER BY depth",
        )
        .bind(id as i64)
        .bind(max_depth as i64)
        .fetch_all(&self.0)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<i64, _>(0) as EntityId,
                    row.get::<Option<i64>, _>(1).map(|p| p as EntityId),
                )
            })
            .collect())
    }

    async fn entity_count(&self, tree: &str) -> Result<usize, ArborError> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM tree_nodes WHERE tree = ?")
            .bind(tree)
            .fetch_one(&self.0)
            .await?;
        Ok(count as usize)
    }

    #[tracing::instrument(skip(self))]
    async fn load_tree(&self, tree: &str) -> Result<Vec<HierarchicalEntity>, ArborError> {
        let mut rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {NODE_COLUMNS} FROM tree_nodes WHERE tree = ? ORDER BY id"
        ))
        .bind(tree)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!("[DbConnection.load_tree] SQL error loading '{}': {}", tree, e);
            e
        })?
        .into_iter()
        .map(HierarchicalEntity::from)
        .collect::<Vec<_>>();
        self.attach_mappings(&mut rows, Some(tree)).await?;
        Ok(rows)
    }

    async fn localized_values(
        &self,
        tree: &str,
        language_id: u32,
    ) -> Result<Vec<LocalizedValue>, ArborError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, String, Option<String>)>(
            "SELECT entity_id, tree, language_id, key, value FROM localized_properties \
             WHERE tree = ? AND language_id = ?",
        )
        .bind(tree)
        .bind(language_id as i64)
        .fetch_all(&self.0)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(entity_id, tree, language_id, key, value)| LocalizedValue {
                entity_id: entity_id as EntityId,
                tree,
                language_id: language_id as u32,
                key,
                value,
            })
            .collect())
    }

    #[tracing::instrument(skip(self, entity, cancel), fields(tree = %entity.tree))]
    async fn insert(
        &self,
        mut entity: HierarchicalEntity,
        cancel: &Cancel,
    ) -> Result<HierarchicalEntity, ArborError> {
        cancel.check()?;
        let work = async {
            let mut tx = self.0.begin().await?;
            let parent_path = match entity.parent_id {
                Some(parent_id) => {
                    let parent = sqlx::query_as::<_, (String, String)>(
                        "SELECT tree, tree_path FROM tree_nodes WHERE id = ?",
                    )
                    .bind(parent_id as i64)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| {
                        ArborError::NotFound(format!("parent {parent_id} of new row"))
                    })?;
                    if parent.0 != entity.tree {
                        return Err(ArborError::InvalidArgument(format!(
                            "parent {parent_id} belongs to tree '{}', not '{}'",
                            parent.0, entity.tree
                        )));
                    }
                    parent.1
                }
                None => String::new(),
            };

            let result = sqlx::query(
                "INSERT INTO tree_nodes (id, tree, parent_id, tree_path, display_order, \
                 published, deleted, name, alias, external_link, media_file_id, badge_text, \
                 badge_style, limited_to_stores, subject_to_acl) \
                 VALUES (?, ?, ?, '', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind((!entity.is_draft()).then_some(entity.id as i64))
            .bind(&entity.tree)
            .bind(entity.parent_id.map(|p| p as i64))
            .bind(entity.display_order)
            .bind(entity.published)
            .bind(entity.deleted)
            .bind(&entity.name)
            .bind(&entity.alias)
            .bind(&entity.external_link)
            .bind(entity.media_file_id.map(|m| m as i64))
            .bind(&entity.badge_text)
            .bind(entity.badge_style)
            .bind(entity.limited_to_stores)
            .bind(entity.subject_to_acl)
            .execute(&mut *tx)
            .await?;
            entity.id = result.last_insert_rowid() as EntityId;
            entity.tree_path = path::build(&parent_path, entity.id)?;

            sqlx::query("UPDATE tree_nodes SET tree_path = ? WHERE id = ?")
                .bind(&entity.tree_path)
                .bind(entity.id as i64)
                .execute(&mut *tx)
                .await?;
            Self::replace_mappings(&mut tx, &entity).await?;
            tx.commit().await?;
            Ok(())
        };
        cancellable(cancel, work).await?;
        Ok(entity)
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn execute_batch_path_rewrite(
        &self,
        rewrite: &PathRewrite,
        cancel: &Cancel,
    ) -> Result<u64, ArborError> {
        let work = async {
            let mut tx = self.0.begin().await?;
            let own = sqlx::query("UPDATE tree_nodes SET parent_id = ?, tree_path = ? WHERE id = ?")
                .bind(rewrite.new_parent_id.map(|p| p as i64))
                .bind(&rewrite.new_path)
                .bind(rewrite.entity_id as i64)
                .execute(&mut *tx)
                .await?;
            if own.rows_affected() != 1 {
                return Err(ArborError::NotFound(format!("row {}", rewrite.entity_id)));
            }

            let prefix = path::descendant_prefix(&rewrite.old_path);
            let descendants = sqlx::query(
                "UPDATE tree_nodes SET tree_path = ? || substr(tree_path, ?) \
                 WHERE tree = ? AND id != ? AND substr(tree_path, 1, ?) = ?",
            )
            .bind(&rewrite.new_path)
            .bind(rewrite.old_path.len() as i64 + 1)
            .bind(&rewrite.tree)
            .bind(rewrite.entity_id as i64)
            .bind(prefix.len() as i64)
            .bind(&prefix)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                tracing::error!(
                    "[DbConnection.execute_batch_path_rewrite] descendant rewrite of {} failed: {}",
                    rewrite.entity_id,
                    e
                );
                e
            })?;
            tx.commit().await?;
            Ok(own.rows_affected() + descendants.rows_affected())
        };
        cancellable(cancel, work).await
    }

    async fn execute_set_parent_null(&self, ids: &[EntityId]) -> Result<u64, ArborError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE tree_nodes SET parent_id = NULL WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id as i64);
        }
        qb.push(")");
        let res = qb.build().execute(&self.0).await?;
        Ok(res.rows_affected())
    }

    async fn write_paths(
        &self,
        paths: &[(EntityId, String)],
        cancel: &Cancel,
    ) -> Result<u64, ArborError> {
        let work = async {
            let mut tx = self.0.begin().await?;
            for (id, new_path) in paths {
                let res = sqlx::query("UPDATE tree_nodes SET tree_path = ? WHERE id = ?")
                    .bind(new_path)
                    .bind(*id as i64)
                    .execute(&mut *tx)
                    .await?;
                if res.rows_affected() != 1 {
                    return Err(ArborError::NotFound(format!("row {id}")));
                }
            }
            tx.commit().await?;
            Ok(paths.len() as u64)
        };
        cancellable(cancel, work).await
    }
}

/// Counts distinct member items of a node, or of its whole subtree when `deep`.
impl ElementCounter for DbConnection {
    async fn count(
        &self,
        key: &CacheVariantKey,
        node_id: EntityId,
        path: &str,
        deep: bool,
    ) -> Result<usize, ArborError> {
        let (count,) = if deep {
            let prefix = path::descendant_prefix(path);
            sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(DISTINCT m.item_id) FROM memberships m \
                 JOIN tree_nodes n ON n.id = m.entity_id \
                 WHERE n.id = ? OR (n.tree = ? AND substr(n.tree_path, 1, ?) = ?)",
            )
            .bind(node_id as i64)
            .bind(&key.tree)
            .bind(prefix.len() as i64)
            .bind(&prefix)
            .fetch_one(&self.0)
            .await?
        } else {
            sqlx::query_as::<_, (i64,)>(
                "SELECT COUNT(DISTINCT item_id) FROM memberships WHERE entity_id = ?",
            )
            .bind(node_id as i64)
            .fetch_one(&self.0)
            .await?
        };
        Ok(count as usize)
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

type MigrationFuture = Pin<Box<dyn Future<Output = Result<Vec<SqlxMigration>, BoxDynError>> + Send>>;

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> MigrationFuture {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_tree_tables",
            sql: "\
            CREATE TABLE tree_nodes (id INTEGER PRIMARY KEY AUTOINCREMENT, tree TEXT NOT NULL, \
                parent_id INTEGER, tree_path TEXT NOT NULL DEFAULT '', \
                display_order INTEGER NOT NULL DEFAULT 0, published INTEGER NOT NULL DEFAULT 1, \
                deleted INTEGER NOT NULL DEFAULT 0, name TEXT NOT NULL, alias TEXT, \
                external_link TEXT, media_file_id INTEGER, badge_text TEXT, \
                badge_style INTEGER NOT NULL DEFAULT 0, \
                limited_to_stores INTEGER NOT NULL DEFAULT 0, \
                subject_to_acl INTEGER NOT NULL DEFAULT 0); \
            CREATE INDEX idx_tree_nodes_path ON tree_nodes (tree, tree_path); \
            CREATE TABLE store_mappings (entity_id INTEGER NOT NULL, store_id INTEGER NOT NULL, \
                UNIQUE(entity_id, store_id)); \
            CREATE TABLE acl_records (entity_id INTEGER NOT NULL, role_id INTEGER NOT NULL, \
                UNIQUE(entity_id, role_id)); \
            CREATE TABLE localized_properties (entity_id INTEGER NOT NULL, tree TEXT NOT NULL, \
                language_id INTEGER NOT NULL, key TEXT NOT NULL, value TEXT, \
                UNIQUE(entity_id, language_id, key));",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "create_memberships",
            sql: "\
            CREATE TABLE memberships (entity_id INTEGER NOT NULL, item_id INTEGER NOT NULL, \
                UNIQUE(entity_id, item_id)); \
            CREATE INDEX idx_memberships_entity ON memberships (entity_id);",
            kind: MigrationType::ReversibleUp,
        },
    ])
}

pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, ArborError> {
    let fqdb = format!("sqlite:{}", db_path.display());
    tracing::debug!("Initializing tree db from file: {:?}", fqdb);
    if !Sqlite::database_exists(&fqdb).await.unwrap_or(false) {
        Sqlite::create_database(&fqdb).await?;
    }
    let options = SqliteConnectOptions::from_str(&fqdb)?
        .read_only(false)
        .disable_statement_logging()
        .create_if_missing(true);
    let pool = sqlx::pool::PoolOptions::<Sqlite>::new()
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM tree_nodes;")
        .fetch_one(&pool)
        .await?;
    tracing::info!("DB Connection initialized. Stored tree nodes: {}", count);

    Ok(pool)
}
