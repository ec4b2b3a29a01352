//! Evaluation runner: run a trusted grading script against submitted code inside the sandbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EvaluationConfig;
use crate::error::EvaluationError;
use crate::identity::{self, shell_quote};
use crate::runtime::{ContainerRuntime, ExecRequest};
use crate::store::SessionStore;
use crate::sync::FileSync;

const RESULT_PREFIX: &str = "RESULT:";
const TEST_CASES_FILE: &str = "testcases.json";
const TIMEOUT_EXIT_CODE: i64 = 124;
const MISSING_SCRIPT_EXIT_CODE: i64 = 127;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    #[serde(default)]
    pub user_id: String,
    pub filename: String,
    pub code: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(alias = "evaluationScript")]
    pub evaluation_script_name: String,
    #[serde(default)]
    pub test_cases: Vec<Value>,
    #[serde(default)]
    pub client_count: Option<u32>,
    #[serde(default)]
    pub client_delay: Option<f64>,
    #[serde(default)]
    pub working_directory_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub results: Vec<TestResult>,
}

/// How an evaluation script expects to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    /// `script <submitted file>`
    Standard,
    /// `script <fixed source name> <test case index>`
    LegacyIndexed,
}

impl EvaluatorKind {
    pub fn for_script(name: &str, legacy_scripts: &[String]) -> Self {
        if legacy_scripts.iter().any(|legacy| legacy == name) {
            EvaluatorKind::LegacyIndexed
        } else {
            EvaluatorKind::Standard
        }
    }

    pub fn arguments(
        &self,
        script_path: &str,
        source_name: &str,
        legacy_source_name: &str,
        index: usize,
    ) -> Vec<String> {
        match self {
            EvaluatorKind::Standard => vec![script_path.to_string(), source_name.to_string()],
            EvaluatorKind::LegacyIndexed => vec![
                script_path.to_string(),
                legacy_source_name.to_string(),
                index.to_string(),
            ],
        }
    }
}

/// Pick the canonical result out of an evaluator's stdout.
///
/// The first line starting with `RESULT:` wins. Without one, the whole output is
/// returned minus blank lines and shell `-x` tracing.
pub fn extract_result(stdout: &str) -> String {
    if let Some(line) = stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .find(|line| line.starts_with(RESULT_PREFIX))
    {
        return line.to_string();
    }

    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !is_trace_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn is_trace_line(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed == "+"
        || trimmed.starts_with("+ ")
        || trimmed.starts_with("set -x")
}

fn validate_script_name(name: &str) -> Result<(), EvaluationError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\');
    if valid {
        Ok(())
    } else {
        Err(EvaluationError::InvalidScript(name.to_string()))
    }
}

/// Fill in the client settings each test case needs but the question may leave out.
fn enrich_test_cases(request: &EvaluationRequest) -> Vec<Value> {
    request
        .test_cases
        .iter()
        .cloned()
        .map(|mut case| {
            if let Value::Object(fields) = &mut case {
                if let Some(count) = request.client_count {
                    fields.entry("clientCount").or_insert(count.into());
                }
                if let Some(delay) = request.client_delay {
                    fields.entry("clientDelay").or_insert(delay.into());
                }
            }
            case
        })
        .collect()
}

pub struct Evaluator {
    store: SessionStore,
    sync: Arc<FileSync>,
    runtime: Arc<dyn ContainerRuntime>,
    config: EvaluationConfig,
    sandbox_user: String,
}

impl Evaluator {
    pub fn new(
        store: SessionStore,
        sync: Arc<FileSync>,
        runtime: Arc<dyn ContainerRuntime>,
        config: EvaluationConfig,
        sandbox_user: String,
    ) -> Self {
        Self {
            store,
            sync,
            runtime,
            config,
            sandbox_user,
        }
    }

    fn script_source(&self, name: &str) -> PathBuf {
        self.config.scripts_dir.join(name)
    }

    fn exec(&self, request: ExecRequest) -> ExecRequest {
        request.user(self.sandbox_user.as_str())
    }

    /// Push the submission and the script, run it, and collect one result per executed test case.
    pub async fn run_and_evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationReport, EvaluationError> {
        let user_id = request.user_id.as_str();
        let script_name = request.evaluation_script_name.as_str();
        validate_script_name(script_name)?;
        let kind = EvaluatorKind::for_script(script_name, &self.config.legacy_scripts);

        let source_path = match &request.working_directory_hint {
            Some(hint) => identity::normalize_path(&self.sync.resolve(hint), &request.filename),
            None => self.sync.resolve(&request.filename),
        };
        let workdir = identity::dirname(&source_path);
        let source_name = identity::basename(&source_path).to_string();

        self.sync
            .push(user_id, &source_path, request.code.as_bytes())
            .await?;

        let script = match tokio::fs::read(self.script_source(script_name)).await {
            Ok(script) => script,
            Err(error) => {
                warn!(user_id, script = script_name, %error, "Evaluation script unavailable");
                return Ok(EvaluationReport {
                    results: vec![TestResult {
                        stdout: String::new(),
                        stderr: format!("evaluation script {} not found", script_name),
                        exit_code: MISSING_SCRIPT_EXIT_CODE,
                    }],
                });
            }
        };

        let session = self
            .store
            .latest_for_user(user_id)
            .await?
            .ok_or_else(|| EvaluationError::NoSession(user_id.to_string()))?;
        let sandbox = session.sandbox_name.as_str();

        let hidden_dir = self.config.hidden_dir.trim_end_matches('/');
        let mkdir = self
            .runtime
            .exec(
                sandbox,
                self.exec(ExecRequest::new(["mkdir", "-p", hidden_dir])),
            )
            .await?;
        if mkdir.exit_code != 0 {
            warn!(sandbox, stderr = %mkdir.stderr.trim(), "Could not create evaluation directory");
        }

        let script_path = format!("{}/{}", hidden_dir, script_name);
        let cases_path = format!("{}/{}", hidden_dir, TEST_CASES_FILE);
        self.sync.push(user_id, &script_path, &script).await?;
        let cases = serde_json::to_vec(&serde_json::json!({ "testCases": enrich_test_cases(request) }))?;
        self.sync.push(user_id, &cases_path, &cases).await?;

        self.runtime
            .exec(
                sandbox,
                self.exec(ExecRequest::new(["chmod", "+x", script_path.as_str()])),
            )
            .await?;

        if kind == EvaluatorKind::LegacyIndexed && source_name != self.config.legacy_source_name {
            self.runtime
                .exec(
                    sandbox,
                    self.exec(
                        ExecRequest::new([
                            "cp",
                            source_path.as_str(),
                            self.config.legacy_source_name.as_str(),
                        ])
                        .working_dir(workdir.as_str()),
                    ),
                )
                .await?;
        }

        let indices = if self.config.evaluate_all_test_cases && !request.test_cases.is_empty() {
            0..request.test_cases.len()
        } else {
            0..1
        };

        let mut results = Vec::new();
        for index in indices {
            let exec = self.exec(
                ExecRequest::new(kind.arguments(
                    &script_path,
                    &source_name,
                    &self.config.legacy_source_name,
                    index,
                ))
                .working_dir(workdir.as_str())
                .env("TEST_CASES_FILE", &cases_path)
                .env("TEST_CASE_INDEX", index),
            );
            let result = self.run_one(sandbox, exec, &script_path).await;
            info!(user_id, script = script_name, index, exit_code = result.exit_code, "Evaluated test case");
            results.push(result);
        }

        let legacy_copy = (kind == EvaluatorKind::LegacyIndexed
            && source_name != self.config.legacy_source_name)
            .then_some(self.config.legacy_source_name.as_str());
        self.cleanup(sandbox, &workdir, &source_name, legacy_copy, &script_path, &cases_path)
            .await;

        Ok(EvaluationReport { results })
    }

    async fn run_one(&self, sandbox: &str, exec: ExecRequest, script_path: &str) -> TestResult {
        match tokio::time::timeout(self.config.timeout(), self.runtime.exec(sandbox, exec)).await {
            Ok(Ok(output)) => TestResult {
                stdout: extract_result(&output.stdout),
                stderr: output.stderr,
                exit_code: output.exit_code,
            },
            Ok(Err(error)) => TestResult {
                stdout: String::new(),
                stderr: error.to_string(),
                exit_code: -1,
            },
            Err(_) => {
                warn!(sandbox, script = script_path, "Evaluation timed out, killing script");
                let kill = ExecRequest::new(["pkill", "-KILL", "-f", script_path]);
                if let Err(error) = self.runtime.exec(sandbox, kill).await {
                    warn!(sandbox, %error, "Failed to kill timed out evaluation");
                }
                TestResult {
                    stdout: String::new(),
                    stderr: format!(
                        "evaluation timed out after {}s",
                        self.config.timeout().as_secs()
                    ),
                    exit_code: TIMEOUT_EXIT_CODE,
                }
            }
        }
    }

    async fn cleanup(
        &self,
        sandbox: &str,
        workdir: &str,
        source_name: &str,
        legacy_copy: Option<&str>,
        script_path: &str,
        cases_path: &str,
    ) {
        let mut targets = vec![shell_quote(script_path), shell_quote(cases_path)];
        targets.extend(
            self.config
                .artifacts
                .iter()
                .map(String::as_str)
                .chain(legacy_copy)
                .filter(|artifact| *artifact != source_name)
                .map(|artifact| shell_quote(&format!("{}/{}", workdir.trim_end_matches('/'), artifact))),
        );
        let script = format!("rm -f {}", targets.join(" "));

        match self
            .runtime
            .exec(sandbox, self.exec(ExecRequest::shell(script)))
            .await
        {
            Ok(output) if output.exit_code != 0 => {
                debug!(sandbox, stderr = %output.stderr.trim(), "Cleanup incomplete")
            }
            Ok(_) => {}
            Err(error) => debug!(sandbox, %error, "Cleanup failed"),
        }
    }
}
