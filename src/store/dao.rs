use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::models::{Article, Comment, CommentNode, Period, RankPair, Ranking, Story};

pub const PAGE_SIZE: i64 = 30;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS stories (
        id          INTEGER PRIMARY KEY,
        title       TEXT NOT NULL,
        url         TEXT,
        text        TEXT,
        score       INTEGER NOT NULL DEFAULT 0,
        by          TEXT NOT NULL,
        time        INTEGER NOT NULL,
        descendants INTEGER NOT NULL DEFAULT 0,
        type        TEXT NOT NULL DEFAULT 'story',
        fetched_at  INTEGER NOT NULL,
        rank        INTEGER,
        dead        BOOLEAN NOT NULL DEFAULT FALSE
    );

    CREATE TABLE IF NOT EXISTS comments (
        id          INTEGER PRIMARY KEY,
        story_id    INTEGER NOT NULL REFERENCES stories(id),
        parent_id   INTEGER,
        by          TEXT,
        text        TEXT,
        time        INTEGER NOT NULL,
        dead        BOOLEAN NOT NULL DEFAULT FALSE,
        deleted     BOOLEAN NOT NULL DEFAULT FALSE,
        fetched_at  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_comments_story ON comments(story_id);

    CREATE TABLE IF NOT EXISTS articles (
        story_id          INTEGER PRIMARY KEY REFERENCES stories(id),
        content           TEXT,
        title             TEXT,
        excerpt           TEXT,
        byline            TEXT,
        extraction_failed BOOLEAN NOT NULL DEFAULT FALSE,
        fetched_at        INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS rankings (
        story_id    INTEGER NOT NULL REFERENCES stories(id),
        period      TEXT NOT NULL,
        score       REAL NOT NULL,
        computed_at INTEGER NOT NULL,
        PRIMARY KEY (story_id, period)
    );
    CREATE INDEX IF NOT EXISTS idx_rankings_period_score ON rankings(period, score DESC);
";

const STORY_COLUMNS: &str =
    "id, title, url, text, score, by, time, descendants, type, fetched_at, rank, dead";

/// Data access over the relay's SQLite store.
///
/// All writes are idempotent upserts; multi-row operations that must be
/// atomic relative to readers (rank swap, per-period ranking replacement,
/// story deletion cascade) run inside a single transaction.
#[derive(Debug, Clone)]
pub struct Dao {
    pool: SqlitePool,
}

impl Dao {
    /// Open (creating if missing) the store at `path` and apply the schema.
    ///
    /// WAL mode allows concurrent readers with a single writer; the busy
    /// timeout covers writer contention across pool connections.
    pub async fn open(path: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open store at {path}"))?;

        let dao = Self { pool };
        dao.migrate().await?;
        Ok(dao)
    }

    /// Open an in-memory store. A single connection keeps the database alive
    /// and shared across all operations.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("failed to parse in-memory dsn")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory store")?;

        let dao = Self { pool };
        dao.migrate().await?;
        Ok(dao)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    // ── stories ──────────────────────────────────────────────────────

    /// Insert or update a story. A NULL incoming rank keeps the stored rank,
    /// so metadata refreshes never knock a story off the front page.
    pub async fn upsert_story(&self, story: &Story) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO stories (id, title, url, text, score, by, time, descendants, type, fetched_at, rank, dead)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title=excluded.title, url=excluded.url, text=excluded.text,
                score=excluded.score, by=excluded.by, time=excluded.time,
                descendants=excluded.descendants, type=excluded.type,
                fetched_at=excluded.fetched_at,
                rank=COALESCE(excluded.rank, stories.rank),
                dead=excluded.dead
            ",
        )
        .bind(story.id)
        .bind(&story.title)
        .bind(&story.url)
        .bind(&story.text)
        .bind(story.score)
        .bind(&story.by)
        .bind(story.time)
        .bind(story.descendants)
        .bind(&story.kind)
        .bind(story.fetched_at)
        .bind(story.rank)
        .bind(story.dead)
        .execute(&self.pool)
        .await
        .context("failed to upsert story")?;
        Ok(())
    }

    pub async fn story_by_id(&self, id: i64) -> Result<Option<Story>> {
        sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load story")
    }

    /// Load a batch of stories by id. Missing ids are simply absent from the
    /// returned map.
    pub async fn stories_by_ids(&self, ids: &[i64]) -> Result<HashMap<i64, Story>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!("SELECT {STORY_COLUMNS} FROM stories WHERE id IN ({placeholders})");
        let mut q = sqlx::query_as::<_, Story>(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("failed to load stories by ids")?;

        Ok(rows.into_iter().map(|s| (s.id, s)).collect())
    }

    /// Ranked front-page stories, paginated. `page` is 1-indexed.
    pub async fn list_by_rank(&self, page: i64) -> Result<(Vec<Story>, i64)> {
        let total = self.count_ranked().await?;
        let stories = sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE rank IS NOT NULL
             ORDER BY rank ASC LIMIT ? OFFSET ?"
        ))
        .bind(PAGE_SIZE)
        .bind((page - 1) * PAGE_SIZE)
        .fetch_all(&self.pool)
        .await
        .context("failed to list ranked stories")?;
        Ok((stories, total))
    }

    pub async fn count_ranked(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM stories WHERE rank IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .context("failed to count ranked stories")
    }

    /// Stories created within `[from, to)`, newest first.
    pub async fn list_by_time_range(&self, from: i64, to: i64) -> Result<Vec<Story>> {
        sqlx::query_as::<_, Story>(&format!(
            "SELECT {STORY_COLUMNS} FROM stories WHERE time >= ? AND time < ?
             ORDER BY time DESC"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("failed to list stories by time range")
    }

    /// Atomically clear every rank and apply the new pairs. Readers observe
    /// either the previous ordering or the new one, never a mix.
    pub async fn swap_ranks(&self, pairs: &[RankPair]) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin rank swap")?;

        sqlx::query("UPDATE stories SET rank = NULL")
            .execute(&mut *tx)
            .await
            .context("failed to clear ranks")?;

        for pair in pairs {
            sqlx::query("UPDATE stories SET rank = ? WHERE id = ?")
                .bind(pair.rank)
                .bind(pair.id)
                .execute(&mut *tx)
                .await
                .context("failed to set rank")?;
        }

        tx.commit().await.context("failed to commit rank swap")?;
        Ok(())
    }

    pub async fn count_stories(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM stories")
            .fetch_one(&self.pool)
            .await
            .context("failed to count stories")
    }

    /// Most recent `fetched_at` across all stories; 0 for an empty store.
    pub async fn max_fetched_at(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(fetched_at) FROM stories")
            .fetch_one(&self.pool)
            .await
            .context("failed to read max fetched_at")?;
        Ok(max.unwrap_or(0))
    }

    // ── comments ─────────────────────────────────────────────────────

    pub async fn upsert_comment(&self, comment: &Comment) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO comments (id, story_id, parent_id, by, text, time, dead, deleted, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                story_id=excluded.story_id, parent_id=excluded.parent_id,
                by=excluded.by, text=excluded.text, time=excluded.time,
                dead=excluded.dead, deleted=excluded.deleted,
                fetched_at=excluded.fetched_at
            ",
        )
        .bind(comment.id)
        .bind(comment.story_id)
        .bind(comment.parent_id)
        .bind(&comment.by)
        .bind(&comment.text)
        .bind(comment.time)
        .bind(comment.dead)
        .bind(comment.deleted)
        .bind(comment.fetched_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert comment")?;
        Ok(())
    }

    /// Read all comments for a story and assemble the tree.
    ///
    /// A comment whose parent is not among the stored rows is promoted to a
    /// root (the parent may simply not have been fetched yet). Deleted
    /// comments with no surviving descendants are pruned; deleted comments
    /// with children remain as placeholders. Returns the roots plus the most
    /// recent `fetched_at` among all rows.
    pub async fn comment_tree(&self, story_id: i64) -> Result<(Vec<CommentNode>, i64)> {
        let rows = sqlx::query_as::<_, Comment>(
            "SELECT id, story_id, parent_id, by, text, time, dead, deleted, fetched_at
             FROM comments WHERE story_id = ? ORDER BY time ASC",
        )
        .bind(story_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load comments")?;

        let ids: HashSet<i64> = rows.iter().map(|r| r.id).collect();
        let mut max_fetched_at = 0;
        let mut by_parent: HashMap<Option<i64>, Vec<Comment>> = HashMap::new();
        for row in rows {
            max_fetched_at = max_fetched_at.max(row.fetched_at);
            let parent = row.parent_id.filter(|p| ids.contains(p));
            by_parent.entry(parent).or_default().push(row);
        }

        let roots = assemble(None, &mut by_parent);
        Ok((prune_deleted(roots), max_fetched_at))
    }

    // ── articles ─────────────────────────────────────────────────────

    pub async fn upsert_article(&self, article: &Article) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO articles (story_id, content, title, excerpt, byline, extraction_failed, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(story_id) DO UPDATE SET
                content=excluded.content, title=excluded.title, excerpt=excluded.excerpt,
                byline=excluded.byline, extraction_failed=excluded.extraction_failed,
                fetched_at=excluded.fetched_at
            ",
        )
        .bind(article.story_id)
        .bind(&article.content)
        .bind(&article.title)
        .bind(&article.excerpt)
        .bind(&article.byline)
        .bind(article.extraction_failed)
        .bind(article.fetched_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert article")?;
        Ok(())
    }

    pub async fn article_by_story(&self, story_id: i64) -> Result<Option<Article>> {
        sqlx::query_as::<_, Article>(
            "SELECT story_id, content, title, excerpt, byline, extraction_failed, fetched_at
             FROM articles WHERE story_id = ?",
        )
        .bind(story_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load article")
    }

    // ── rankings ─────────────────────────────────────────────────────

    /// Replace every ranking row for a period in one transaction, so readers
    /// never observe an empty or half-written period.
    pub async fn replace_rankings(&self, period: Period, rows: &[Ranking]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin ranking replace")?;

        sqlx::query("DELETE FROM rankings WHERE period = ?")
            .bind(period.as_str())
            .execute(&mut *tx)
            .await
            .context("failed to clear rankings")?;

        for row in rows {
            sqlx::query(
                "INSERT INTO rankings (story_id, period, score, computed_at) VALUES (?, ?, ?, ?)",
            )
            .bind(row.story_id)
            .bind(period.as_str())
            .bind(row.score)
            .bind(row.computed_at)
            .execute(&mut *tx)
            .await
            .context("failed to insert ranking")?;
        }

        tx.commit().await.context("failed to commit rankings")?;
        Ok(())
    }

    /// Stories for a period ordered by ranking score, paginated.
    pub async fn stories_by_period(&self, period: Period, page: i64) -> Result<(Vec<Story>, i64)> {
        let total = self.count_rankings(period).await?;
        let stories = sqlx::query_as::<_, Story>(
            "SELECT s.id, s.title, s.url, s.text, s.score, s.by, s.time, s.descendants,
                    s.type, s.fetched_at, s.rank, s.dead
             FROM rankings r
             JOIN stories s ON s.id = r.story_id
             WHERE r.period = ?
             ORDER BY r.score DESC
             LIMIT ? OFFSET ?",
        )
        .bind(period.as_str())
        .bind(PAGE_SIZE)
        .bind((page - 1) * PAGE_SIZE)
        .fetch_all(&self.pool)
        .await
        .context("failed to list stories by period")?;
        Ok((stories, total))
    }

    pub async fn count_rankings(&self, period: Period) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM rankings WHERE period = ?")
            .bind(period.as_str())
            .fetch_one(&self.pool)
            .await
            .context("failed to count rankings")
    }

    // ── cleanup ──────────────────────────────────────────────────────

    /// Ids of unranked stories last fetched before `cutoff` that no ranking
    /// period still references.
    pub async fn stale_story_ids(&self, cutoff: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT s.id FROM stories s
             WHERE s.rank IS NULL
             AND s.fetched_at < ?
             AND NOT EXISTS (SELECT 1 FROM rankings r WHERE r.story_id = s.id)",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to find stale stories")
    }

    /// Delete a story together with its comments, article, and rankings.
    pub async fn delete_story(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin delete")?;

        sqlx::query("DELETE FROM comments WHERE story_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to delete comments")?;
        sqlx::query("DELETE FROM articles WHERE story_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to delete article")?;
        sqlx::query("DELETE FROM rankings WHERE story_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to delete rankings")?;
        sqlx::query("DELETE FROM stories WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("failed to delete story")?;

        tx.commit().await.context("failed to commit delete")?;
        Ok(())
    }

    /// Compaction hint after a sweep has deleted rows.
    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM")
            .execute(&self.pool)
            .await
            .context("vacuum failed")?;
        Ok(())
    }
}

fn assemble(
    parent: Option<i64>,
    by_parent: &mut HashMap<Option<i64>, Vec<Comment>>,
) -> Vec<CommentNode> {
    let rows = by_parent.remove(&parent).unwrap_or_default();
    rows.into_iter()
        .map(|row| {
            let id = row.id;
            let mut node = CommentNode::from_row(row);
            node.children = assemble(Some(id), by_parent);
            node
        })
        .collect()
}

fn prune_deleted(nodes: Vec<CommentNode>) -> Vec<CommentNode> {
    nodes
        .into_iter()
        .filter_map(|mut node| {
            node.children = prune_deleted(node.children);
            if node.deleted && node.children.is_empty() {
                None
            } else {
                Some(node)
            }
        })
        .collect()
}
