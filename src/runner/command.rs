use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// 実行する外部コマンド (argv 形式、シェル文字列は使わない)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// 継承した環境変数への上書き
    pub env: BTreeMap<String, String>,
    /// stderr を出力行に混ぜるか (false ならログにだけ流す)
    pub merge_stderr: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            merge_stderr: true,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// 機械可読な出力を stdout から読むコマンド向け
    #[must_use]
    pub fn stdout_only(mut self) -> Self {
        self.merge_stderr = false;
        self
    }

    /// プログラム名と引数
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// tokio の Command を組み立てる (unix では子が自分のプロセスグループを持つ)
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = std::process::Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        tokio::process::Command::from(command)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv().join(" "))
    }
}
