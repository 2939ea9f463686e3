use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::{truncate_to_byte_limit, BuiltinToolExecutor, ToolOutput};

impl BuiltinToolExecutor {
    pub(super) fn bash(&self, command: &str, timeout_sec: Option<u64>, cwd: &Path) -> ToolOutput {
        let timeout = timeout_sec
            .unwrap_or(self.limits.bash_default_timeout_sec)
            .min(self.limits.bash_max_timeout_sec);
        let cwd = if cwd.is_dir() {
            cwd
        } else {
            self.workspace_root.as_path()
        };

        let mut child = match Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                return ToolOutput::fail(format!("Failed to launch bash command: {error}"));
            }
        };

        // Pipes are drained while waiting; a full pipe would otherwise stall the child.
        let stdout = spawn_pipe_reader(child.stdout.take());
        let stderr = spawn_pipe_reader(child.stderr.take());

        let (timed_out, status) = match child.wait_timeout(Duration::from_secs(timeout)) {
            Ok(Some(status)) => (false, status),
            Ok(None) => {
                warn!(timeout, "bash command timed out; killing");
                let _ = child.kill();
                match child.wait() {
                    Ok(status) => (true, status),
                    Err(error) => {
                        return ToolOutput::fail(format!(
                            "Command timed out after {timeout}s and wait failed: {error}"
                        ));
                    }
                }
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return ToolOutput::fail(format!("Failed waiting for bash command: {error}"));
            }
        };

        let stdout = join_pipe_reader(stdout);
        let stderr = join_pipe_reader(stderr);

        let status_label = if timed_out {
            format!("timeout after {timeout}s")
        } else {
            format_exit_status(status)
        };
        debug!(status = %status_label, stdout_bytes = stdout.len(), stderr_bytes = stderr.len(), "bash finished");

        let content = format!(
            "status: {status_label}\nstdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr)
        );

        ToolOutput {
            ok: !timed_out && status.success(),
            content: truncate_to_byte_limit(content, self.limits.bash_max_output_bytes),
            files_touched: Vec::new(),
            exit_code: if timed_out { None } else { status.code() },
        }
    }
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("coding-agent-bash-pipe".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
        .ok()
}

fn join_pipe_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

fn format_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}
