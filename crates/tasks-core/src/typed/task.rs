//! Task trait - 実行可能なタスクの定義
//!
//! engine から見たタスクは「バイト列の request/state を読み込み、実行し、
//! 途中経過を state として書き戻すもの」です。中身の形式は各タスクが決めます
//! （`typed::codec` を使えば JSON）。

use async_trait::async_trait;

use crate::app::ExecutionContext;
use crate::domain::{Result, TaskId};

/// Task はひとつの task_type の振る舞い
///
/// # ライフサイクル
/// 1. registry の factory で空のインスタンスを作る
/// 2. `load(request, state)` で永続化された内容を復元
/// 3. `run` または `cancel` を実行（何度でも再開されうる）
///
/// `run` と `cancel` は冪等でなければなりません。lease を失った runner の
/// 実行と新しい runner の実行が重なることがあるためです。
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Current progress as opaque bytes.
    fn save(&self) -> Result<Vec<u8>>;

    async fn load(&mut self, request: &[u8], state: &[u8]) -> Result<()>;

    async fn run(&mut self, exec: &ExecutionContext) -> Result<()>;

    /// Undo whatever `run` managed to do.
    async fn cancel(&mut self, exec: &ExecutionContext) -> Result<()>;

    async fn get_metadata(&self, _id: TaskId) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn get_response(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// task_type を型に結び付ける
///
/// # 命名規約
/// - `{namespace}.{Action}`
/// - 例: `tasks.ClearEndedTasks`
pub trait TaskType: Task + Default {
    const TYPE: &'static str;
}
