use std::process::Stdio;
use std::time::Duration;

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::CommandSpec;
use crate::error::{DeployError, DeployResult};

/// パイプ読み取りと受け手の間でバッファする行数
const LINE_BUFFER: usize = 256;

/// 外部コマンドを起動し、その出力行を返す
pub trait CommandRunner: Send + Sync {
    /// `spec` を起動する。`cancel` のキャンセル (または戻り値の drop) で
    /// プロセスを終了させる
    fn spawn(&self, spec: &CommandSpec, cancel: CancellationToken) -> DeployResult<OutputLines>;
}

/// 実行中プロセス 1 つ分の出力 (stdout と、必要なら stderr を合流)。
///
/// プロセス終了まで行を返し、その後に終了状態を返す。
/// 非ゼロ終了は [`DeployError::ExternalCommand`] になる。
pub struct OutputLines {
    lines: mpsc::Receiver<String>,
    exit: Option<oneshot::Receiver<DeployResult<()>>>,
    _kill_on_drop: Option<DropGuard>,
}

impl OutputLines {
    pub fn from_parts(
        lines: mpsc::Receiver<String>,
        exit: oneshot::Receiver<DeployResult<()>>,
    ) -> Self {
        Self {
            lines,
            exit: Some(exit),
            _kill_on_drop: None,
        }
    }

    /// 既に分かっている出力から作る (記録済みの実行など)
    pub fn from_lines(lines: Vec<String>, exit: DeployResult<()>) -> Self {
        let (line_tx, line_rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            // capacity covers every line
            let _ = line_tx.try_send(line);
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        let _ = exit_tx.send(exit);
        Self::from_parts(line_rx, exit_rx)
    }

    /// 次の出力行。正常終了後は `None`
    pub async fn next_line(&mut self) -> DeployResult<Option<String>> {
        if let Some(line) = self.lines.recv().await {
            return Ok(Some(line));
        }
        match self.exit.take() {
            Some(exit) => match exit.await {
                Ok(result) => result.map(|()| None),
                Err(_) => Err(DeployError::Io(std::io::Error::other(
                    "process watcher stopped before reporting exit status",
                ))),
            },
            None => Ok(None),
        }
    }

    /// 全行を読み切る。プロセスが失敗していればエラー
    pub async fn collect_lines(mut self) -> DeployResult<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await? {
            lines.push(line);
        }
        Ok(lines)
    }
}

/// 実際の子プロセスとしてコマンドを実行
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    terminate_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ProcessRunner {
    /// `terminate_grace` はキャンセル時の SIGTERM から SIGKILL までの猶予
    pub fn new(terminate_grace: Duration) -> Self {
        Self { terminate_grace }
    }
}

impl CommandRunner for ProcessRunner {
    fn spawn(&self, spec: &CommandSpec, cancel: CancellationToken) -> DeployResult<OutputLines> {
        let argv = spec.argv();
        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DeployError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(command = %spec, pid = ?pid, "Spawned process");

        // 出力を受け取るチャンネル
        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, line_tx.clone())));
        // stderr は合流させるか、ログにだけ流す
        let stderr_task = child.stderr.take().map(|err| {
            if spec.merge_stderr {
                tokio::spawn(forward_lines(err, line_tx))
            } else {
                tokio::spawn(log_lines(err, spec.program.clone()))
            }
        });

        let kill = cancel.child_token();
        let guard = kill.clone().drop_guard();
        let grace = self.terminate_grace;
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = wait_for_exit(child, argv, kill.clone(), grace).await;

            // 終了状態は全行を転送し終えてから返す
            let readers: Vec<_> = [stdout_task, stderr_task].into_iter().flatten().collect();
            let aborts: Vec<_> = readers.iter().map(|task| task.abort_handle()).collect();
            let result = tokio::select! {
                biased;
                _ = join_all(readers) => result,
                // パイプを引き継いだ孫プロセスが残っていても打ち切る
                _ = kill.cancelled() => {
                    warn!(pid = ?pid, "Output still open after exit, killing process group");
                    kill_group(pid);
                    for abort in &aborts {
                        abort.abort();
                    }
                    result.and(Err(DeployError::Cancelled))
                }
            };
            let _ = exit_tx.send(result);
        });

        Ok(OutputLines {
            lines: line_rx,
            exit: Some(exit_rx),
            _kill_on_drop: Some(guard),
        })
    }
}

/// 1 行読む。末尾の空白を落とし、不正な UTF-8 は置換する
async fn read_line<R>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).trim_end().to_string()),
        Err(e) => {
            debug!(error = %e, "Stopped reading process output");
            None
        }
    }
}

async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    while let Some(line) = read_line(&mut reader, &mut buf).await {
        if tx.send(line).await.is_err() {
            break;
        }
    }
}

async fn log_lines<R>(reader: R, program: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    while let Some(line) = read_line(&mut reader, &mut buf).await {
        if !line.is_empty() {
            warn!(program = %program, "{}", line);
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    argv: Vec<String>,
    cancel: CancellationToken,
    grace: Duration,
) -> DeployResult<()> {
    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!(command = %argv.join(" "), "Cancelled, terminating process group");
            terminate(&mut child, grace).await;
            return Err(DeployError::Cancelled);
        }
    };

    if status.success() {
        debug!(command = %argv.join(" "), "Process exited successfully");
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        warn!(command = %argv.join(" "), code, "Process failed");
        Err(DeployError::ExternalCommand { code, argv })
    }
}

#[cfg(unix)]
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
        let _ = tokio::time::timeout(grace, child.wait()).await;
        // SIGTERM を無視したグループ内の残り
        let _ = killpg(pgid, Signal::SIGKILL);
    }
    let _ = child.kill().await;
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child, _grace: Duration) {
    let _ = child.kill().await;
}

/// 終了済みの子が率いていたグループに残るプロセスを止める
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}
