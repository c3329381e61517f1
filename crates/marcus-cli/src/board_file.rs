//! Local file-backed `Board` (§6.1) for running `marcus serve` without a
//! live kanban provider wired in.
//!
//! The core never assumes a concrete Board; this is one default,
//! swappable implementation kept alongside the CLI binary rather than in
//! `marcus-db`, since it is a deployment convenience and not part of the
//! coordination core itself. Tasks live at `<data_dir>/board.json`,
//! comments at `<data_dir>/board_comments.json` — both plain
//! [`JsonStore`] collections, the same atomic-write idiom the ledger uses.

use std::path::Path;

use async_trait::async_trait;
use marcus_db::capability::{Board, TaskPatch};
use marcus_db::ledger::JsonStore;
use marcus_db::model::Task;

pub struct FileBoard {
    tasks: JsonStore<Task>,
    comments: JsonStore<Vec<String>>,
}

impl FileBoard {
    pub fn open(data_dir: impl AsRef<Path>, fsync: bool) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            tasks: JsonStore::new(data_dir.join("board.json"), fsync),
            comments: JsonStore::new(data_dir.join("board_comments.json"), fsync),
        }
    }
}

#[async_trait]
impl Board for FileBoard {
    async fn list_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(self.tasks.load().await?.into_values().collect())
    }

    async fn update_task(&self, task_id: &str, patch: TaskPatch) -> anyhow::Result<()> {
        let Some(mut task) = self.tasks.get(task_id).await? else {
            anyhow::bail!("unknown task: {task_id}");
        };
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(assigned_to) = patch.assigned_to {
            task.assigned_to = assigned_to;
        }
        task.updated_at = chrono::Utc::now();
        self.tasks.save(task_id, task).await?;
        if let Some(comment) = patch.comment {
            self.add_comment(task_id, &comment).await?;
        }
        Ok(())
    }

    async fn add_comment(&self, task_id: &str, text: &str) -> anyhow::Result<()> {
        let mut log = self.comments.get(task_id).await?.unwrap_or_default();
        log.push(text.to_string());
        self.comments.save(task_id, log).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_db::model::{Priority, TaskStatus};

    fn sample_task(id: &str) -> Task {
        Task {
            task_id: id.to_string(),
            name: format!("Task {id}"),
            description: "desc".to_string(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            assigned_to: None,
            dependencies: Vec::new(),
            labels: Vec::new(),
            estimated_hours: 0.0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn update_task_applies_patch_and_records_comment() {
        let dir = tempfile::TempDir::new().unwrap();
        let board = FileBoard::open(dir.path(), false);
        board.tasks.save("t1", sample_task("t1")).await.unwrap();

        board
            .update_task(
                "t1",
                TaskPatch { status: Some(TaskStatus::InProgress), assigned_to: Some(Some("agent-1".to_string())), comment: Some("started".to_string()) },
            )
            .await
            .unwrap();

        let tasks = board.list_tasks().await.unwrap();
        let task = tasks.iter().find(|t| t.task_id == "t1").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.assigned_to.as_deref(), Some("agent-1"));

        let log = board.comments.get("t1").await.unwrap().unwrap();
        assert_eq!(log, vec!["started".to_string()]);
    }

    #[tokio::test]
    async fn update_task_on_unknown_id_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let board = FileBoard::open(dir.path(), false);
        assert!(board.update_task("missing", TaskPatch::default()).await.is_err());
    }
}
