//! Bearer-token protected command execution.

use std::io::{self, Read};
use std::process::{ExitStatus, Stdio};

use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::RunCommandAction;

/// Body of a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub output: String,
    pub code: i32,
}

pub struct RunCommand {
    token_digest: [u8; 32],
    program: String,
    args: Vec<String>,
}

impl RunCommand {
    pub fn new(action: &RunCommandAction) -> Self {
        let (program, args) = match action.command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            token_digest: Sha256::digest(action.token.as_bytes()).into(),
            program,
            args,
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        if !self.authorized(request.headers()) {
            tracing::warn!(path = %request.uri().path(), "Rejected command request");
            return StatusCode::FORBIDDEN.into_response();
        }

        let result = self.run().await;
        tracing::info!(program = %self.program, code = result.code, "Command finished");
        Json(result).into_response()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(token) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
        else {
            return false;
        };
        // Fixed-length digests, compared whole.
        let digest: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        digest == self.token_digest
    }

    async fn run(&self) -> CommandOutput {
        if self.program.is_empty() {
            return CommandOutput {
                output: "empty command".to_string(),
                code: 1,
            };
        }

        match self.run_combined().await {
            Ok((output, status)) => CommandOutput {
                output: String::from_utf8_lossy(&output).into_owned(),
                // No exit code means the process was killed by a signal.
                code: status.code().unwrap_or(1),
            },
            Err(e) => {
                tracing::error!(program = %self.program, error = %e, "Failed to start command");
                CommandOutput {
                    output: e.to_string(),
                    code: 1,
                }
            }
        }
    }

    /// Runs the command with stdout and stderr on one pipe, so the output
    /// keeps the order in which the two streams were written.
    async fn run_combined(&self) -> io::Result<(Vec<u8>, ExitStatus)> {
        let (mut reader, writer) = io::pipe()?;
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        let spawned = command.spawn();
        // The command keeps the write ends open until dropped.
        drop(command);
        let mut child = spawned?;

        let read = tokio::task::spawn_blocking(move || {
            let mut output = Vec::new();
            reader.read_to_end(&mut output).map(|_| output)
        });
        let status = child.wait().await?;
        let output = read.await.map_err(io::Error::other)??;
        Ok((output, status))
    }
}

/// Token from `Bearer <token>`; `None` for other schemes or an empty token.
fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn command(argv: &[&str]) -> RunCommand {
        RunCommand::new(&RunCommandAction {
            token: "s3cret".to_string(),
            command: argv.iter().map(|s| s.to_string()).collect(),
        })
    }

    fn request(authorization: Option<&str>) -> Request {
        let mut builder = Request::builder().method("POST").uri("/deploy");
        if let Some(value) = authorization {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("bearer abc"), None);
    }

    #[tokio::test]
    async fn test_wrong_or_missing_token_is_forbidden_without_body() {
        let cmd = command(&["echo", "should not run"]);
        for auth in [None, Some("Bearer wrongtoken"), Some("s3cret"), Some("Bearer ")] {
            let response = cmd.handle(request(auth)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{auth:?}");
            assert!(body(response).await.is_empty());
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_and_reports_output() {
        let cmd = command(&["sh", "-c", "echo out; echo err >&2"]);
        let response = cmd.handle(request(Some("Bearer s3cret"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let result: CommandOutput = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(
            result,
            CommandOutput {
                output: "out\nerr\n".to_string(),
                code: 0
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_interleaves_streams_in_write_order() {
        let cmd = command(&["sh", "-c", "echo one; echo two >&2; echo three; echo four >&2"]);
        let result = cmd.run().await;
        assert_eq!(result.output, "one\ntwo\nthree\nfour\n");
        assert_eq!(result.code, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_code_reported() {
        let cmd = command(&["sh", "-c", "echo failing; exit 3"]);
        let response = cmd.handle(request(Some("Bearer s3cret"))).await;
        assert_eq!(response.status(), StatusCode::OK);

        let result: CommandOutput = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(result.code, 3);
        assert_eq!(result.output, "failing\n");
    }

    #[tokio::test]
    async fn test_spawn_failure_reported_as_code_one() {
        let cmd = command(&["/nonexistent/portico-test-binary"]);
        let response = cmd.handle(request(Some("Bearer s3cret"))).await;
        let result: CommandOutput = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(result.code, 1);
        assert!(!result.output.is_empty());
    }
}
