use std::collections::HashMap;

use crate::error::{CoreError, CoreResult};
use crate::segment::Segment;
use crate::task::{Task, TaskId};

#[cfg(feature = "sqlite")]
use crate::error::ErrorKind;
#[cfg(feature = "sqlite")]
use crate::segment::SegmentState;
#[cfg(feature = "sqlite")]
use crate::task::{OutputFormat, PostProcess, SegmentRange, TaskStatus};
#[cfg(feature = "sqlite")]
use rusqlite::params;
#[cfg(feature = "sqlite")]
use std::path::PathBuf;

pub trait Storage: Send + Sync {
    fn save_task(&mut self, task: &Task) -> CoreResult<()>;
    fn load_task(&self, id: &TaskId) -> CoreResult<Task>;
    fn list_tasks(&self) -> CoreResult<Vec<Task>>;
    fn delete_task(&mut self, id: &TaskId) -> CoreResult<()>;

    fn save_segments(&mut self, task_id: &TaskId, segments: &[Segment]) -> CoreResult<()>;
    fn load_segments(&self, task_id: &TaskId) -> CoreResult<Vec<Segment>>;
}

#[derive(Default)]
pub struct MemoryStorage {
    tasks: HashMap<TaskId, Task>,
    segments: HashMap<TaskId, Vec<Segment>>,
}

impl Storage for MemoryStorage {
    fn save_task(&mut self, task: &Task) -> CoreResult<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> CoreResult<Task> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| (task.created_at, task.id));
        Ok(tasks)
    }

    fn delete_task(&mut self, id: &TaskId) -> CoreResult<()> {
        self.tasks.remove(id);
        self.segments.remove(id);
        Ok(())
    }

    fn save_segments(&mut self, task_id: &TaskId, segments: &[Segment]) -> CoreResult<()> {
        self.segments.insert(*task_id, segments.to_vec());
        Ok(())
    }

    fn load_segments(&self, task_id: &TaskId) -> CoreResult<Vec<Segment>> {
        Ok(self
            .segments
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(feature = "sqlite")]
pub struct SqliteStorage {
    pub path: String,
}

#[cfg(feature = "sqlite")]
fn db_err(err: rusqlite::Error) -> CoreError {
    CoreError::Storage(err.to_string())
}

#[cfg(feature = "sqlite")]
fn bad_column(index: usize, what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("invalid {what}: {value}").into(),
    )
}

#[cfg(feature = "sqlite")]
impl SqliteStorage {
    pub fn new(path: impl Into<String>) -> CoreResult<Self> {
        let storage = Self { path: path.into() };
        storage.init()?;
        Ok(storage)
    }

    fn conn(&self) -> CoreResult<rusqlite::Connection> {
        rusqlite::Connection::open(&self.path).map_err(db_err)
    }

    fn init(&self) -> CoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                playlist_url TEXT NOT NULL,
                playlist_text TEXT NOT NULL,
                title TEXT NOT NULL,
                output_dir TEXT NOT NULL,
                output_format TEXT NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                decrypt INTEGER NOT NULL,
                concurrency INTEGER NOT NULL,
                status TEXT NOT NULL,
                bytes_completed INTEGER NOT NULL DEFAULT 0,
                message TEXT,
                output_path TEXT,
                post_process TEXT,
                post_process_detail TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                state TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                retries INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                FOREIGN KEY(task_id) REFERENCES tasks(id)
            );
            CREATE TABLE IF NOT EXISTS headers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                FOREIGN KEY(task_id) REFERENCES tasks(id)
            );
            CREATE INDEX IF NOT EXISTS segments_by_task ON segments(task_id, segment_index);
            ",
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl Storage for SqliteStorage {
    fn save_task(&mut self, task: &Task) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;

        let output_dir = task.output_dir.to_string_lossy().into_owned();
        let output_path = task
            .output_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());
        tx.execute(
            "
            INSERT INTO tasks (
                id, playlist_url, playlist_text, title, output_dir, output_format,
                range_start, range_end, decrypt, concurrency, status, bytes_completed,
                message, output_path, post_process, post_process_detail, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                playlist_url=excluded.playlist_url,
                playlist_text=excluded.playlist_text,
                title=excluded.title,
                output_dir=excluded.output_dir,
                output_format=excluded.output_format,
                range_start=excluded.range_start,
                range_end=excluded.range_end,
                decrypt=excluded.decrypt,
                concurrency=excluded.concurrency,
                status=excluded.status,
                bytes_completed=excluded.bytes_completed,
                message=excluded.message,
                output_path=excluded.output_path,
                post_process=excluded.post_process,
                post_process_detail=excluded.post_process_detail,
                created_at=excluded.created_at,
                updated_at=excluded.updated_at
            ",
            params![
                task.id.to_string(),
                task.playlist_url.as_str(),
                task.playlist_text.as_str(),
                task.title.as_str(),
                output_dir,
                task.output_format.as_str(),
                task.range.start as i64,
                task.range.end as i64,
                task.decrypt,
                task.concurrency as i64,
                task.status.as_str(),
                task.bytes_completed as i64,
                task.message.as_deref(),
                output_path,
                task.post_process.as_ref().map(|p| p.kind()),
                task.post_process.as_ref().and_then(|p| p.detail()),
                task.created_at as i64,
                task.updated_at as i64,
            ],
        )
        .map_err(db_err)?;

        tx.execute("DELETE FROM headers WHERE task_id = ?1", params![task.id.to_string()])
            .map_err(db_err)?;
        for (name, value) in &task.headers {
            tx.execute(
                "INSERT INTO headers (task_id, name, value) VALUES (?1, ?2, ?3)",
                params![task.id.to_string(), name, value],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_task(&self, id: &TaskId) -> CoreResult<Task> {
        use rusqlite::OptionalExtension;

        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT id, playlist_url, playlist_text, title, output_dir, output_format,
                       range_start, range_end, decrypt, concurrency, status, bytes_completed,
                       message, output_path, post_process, post_process_detail,
                       created_at, updated_at
                FROM tasks WHERE id = ?1
                ",
            )
            .map_err(db_err)?;

        let task = stmt
            .query_row(params![id.to_string()], |row| {
                let raw_id: String = row.get(0)?;
                let task_id =
                    TaskId::parse_str(&raw_id).map_err(|_| bad_column(0, "task id", &raw_id))?;
                let format: String = row.get(5)?;
                let output_format = OutputFormat::from_str(&format)
                    .ok_or_else(|| bad_column(5, "output format", &format))?;
                let status: String = row.get(10)?;
                let status = TaskStatus::from_str(&status)
                    .ok_or_else(|| bad_column(10, "status", &status))?;
                let post_process = match row.get::<_, Option<String>>(14)? {
                    Some(kind) => Some(
                        PostProcess::from_parts(&kind, row.get(15)?)
                            .ok_or_else(|| bad_column(14, "post-process outcome", &kind))?,
                    ),
                    None => None,
                };

                Ok(Task {
                    id: task_id,
                    playlist_url: row.get(1)?,
                    playlist_text: row.get(2)?,
                    title: row.get(3)?,
                    output_dir: PathBuf::from(row.get::<_, String>(4)?),
                    output_format,
                    range: SegmentRange {
                        start: row.get::<_, i64>(6)? as usize,
                        end: row.get::<_, i64>(7)? as usize,
                    },
                    decrypt: row.get(8)?,
                    concurrency: row.get::<_, i64>(9)? as usize,
                    headers: HashMap::new(),
                    status,
                    bytes_completed: row.get::<_, i64>(11)? as u64,
                    message: row.get(12)?,
                    output_path: row.get::<_, Option<String>>(13)?.map(PathBuf::from),
                    post_process,
                    created_at: row.get::<_, i64>(16)? as u64,
                    updated_at: row.get::<_, i64>(17)? as u64,
                })
            })
            .optional()
            .map_err(db_err)?;

        let mut task = task.ok_or_else(|| CoreError::NotFound(id.to_string()))?;

        let mut header_stmt = conn
            .prepare("SELECT name, value FROM headers WHERE task_id = ?1")
            .map_err(db_err)?;
        let headers = header_stmt
            .query_map(params![id.to_string()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        for header in headers {
            let (name, value) = header.map_err(db_err)?;
            task.headers.insert(name, value);
        }

        Ok(task)
    }

    fn list_tasks(&self) -> CoreResult<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM tasks ORDER BY created_at ASC, id ASC")
            .map_err(db_err)?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut tasks = Vec::new();
        for id in ids {
            let id = id.map_err(db_err)?;
            let task_id = TaskId::parse_str(&id).map_err(|_| CoreError::Storage(id))?;
            tasks.push(self.load_task(&task_id)?);
        }
        Ok(tasks)
    }

    fn delete_task(&mut self, id: &TaskId) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        // Child rows reference tasks(id); remove them first.
        tx.execute("DELETE FROM headers WHERE task_id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        tx.execute("DELETE FROM segments WHERE task_id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        tx.execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn save_segments(&mut self, task_id: &TaskId, segments: &[Segment]) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "DELETE FROM segments WHERE task_id = ?1",
            params![task_id.to_string()],
        )
        .map_err(db_err)?;
        for segment in segments {
            tx.execute(
                "
                INSERT INTO segments (task_id, segment_index, state, bytes, retries, last_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    task_id.to_string(),
                    segment.index as i64,
                    segment.state.as_str(),
                    segment.bytes as i64,
                    segment.retries as i64,
                    segment.last_error.map(|kind| kind.as_str()),
                ],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_segments(&self, task_id: &TaskId) -> CoreResult<Vec<Segment>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "
                SELECT segment_index, state, bytes, retries, last_error
                FROM segments WHERE task_id = ?1 ORDER BY segment_index ASC
                ",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![task_id.to_string()], |row| {
                let state: String = row.get(1)?;
                let state = SegmentState::from_str(&state)
                    .ok_or_else(|| bad_column(1, "segment state", &state))?;
                let last_error = match row.get::<_, Option<String>>(4)? {
                    Some(kind) => Some(
                        ErrorKind::from_str(&kind)
                            .ok_or_else(|| bad_column(4, "error kind", &kind))?,
                    ),
                    None => None,
                };
                Ok(Segment {
                    index: row.get::<_, i64>(0)? as usize,
                    state,
                    bytes: row.get::<_, i64>(2)? as u64,
                    retries: row.get::<_, i64>(3)? as u32,
                    last_error,
                })
            })
            .map_err(db_err)?;

        let mut segments = Vec::new();
        for row in rows {
            segments.push(row.map_err(db_err)?);
        }
        Ok(segments)
    }
}
