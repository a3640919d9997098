use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CommandRunner, CommandSpec};
use crate::deploy::{ProgressEvent, StageStatus};
use crate::error::{DeployError, DeployResult};

/// イベントを 1 つ送る。受信側が閉じていれば実行をキャンセル
pub(crate) async fn emit<S: StageStatus>(
    events: &mpsc::Sender<ProgressEvent<S>>,
    event: ProgressEvent<S>,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    if events.send(event).await.is_err() {
        cancel.cancel();
        return Err(DeployError::Cancelled);
    }
    Ok(())
}

/// コマンドを 1 ステージとして実行する。
/// 出力 1 行ごとに `status` 付きのイベントを送り、そこまでのログを載せる
pub(crate) async fn stream_stage<S: StageStatus>(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    status: S,
    logs: &mut Vec<String>,
    events: &mpsc::Sender<ProgressEvent<S>>,
    cancel: &CancellationToken,
) -> DeployResult<()> {
    let mut output = runner.spawn(spec, cancel.clone())?;
    while let Some(line) = output.next_line().await? {
        logs.push(line.clone());
        emit(events, ProgressEvent::line(status, line, logs), cancel).await?;
    }
    Ok(())
}
