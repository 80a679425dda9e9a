use anyhow::Result;
use haproxy_canary_controller::{marathon, Weight};
use serde::Serialize;
use std::path::Path;

const CHECK: &str = "√";
const EX: &str = "×";
const CATEGORY: &str = "haproxy-canary";
const TROUBLESHOOTING: &str = "https://www.haproxy.com/documentation/haproxy-configuration-manual/";

#[derive(Serialize)]
struct CheckOutput<'a> {
    success: bool,
    categories: Vec<Category<'a>>,
}

#[derive(Serialize)]
struct Category<'a> {
    category_name: &'static str,
    checks: &'a [CheckResult],
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    #[default]
    Success,
    Error,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CheckResult {
    description: String,
    result: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// What the checks inspect.
pub struct Target<'a> {
    pub marathon: &'a marathon::Client,
    pub template_path: &'a Path,
    pub output_path: &'a Path,
    pub weights: &'a [Weight],
}

impl CheckResult {
    fn ok(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    fn failed(description: impl Into<String>, error: impl ToString) -> Self {
        Self {
            description: description.into(),
            result: CheckStatus::Error,
            error: Some(error.to_string()),
            hint: None,
        }
    }

    fn with_hint(mut self, hint: &'static str) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn success(&self) -> bool {
        matches!(self.result, CheckStatus::Success)
    }
}

pub async fn endpoint_check(marathon: &marathon::Client, endpoint: &str) -> CheckResult {
    let description = format!("marathon is reachable at {endpoint}");
    match marathon.fetch_from(endpoint).await {
        Ok(snapshot) => {
            tracing::debug!(%endpoint, apps = snapshot.apps.len(), "fetched marathon state");
            CheckResult::ok(description)
        }
        Err(error) => CheckResult::failed(description, error),
    }
}

pub async fn output_dir_check(output_path: &Path) -> CheckResult {
    let dir = match output_path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let description = "configuration output directory exists";
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => CheckResult::ok(description),
        Ok(_) => CheckResult::failed(description, format!("{} is not a directory", dir.display())),
        Err(error) => CheckResult::failed(description, format!("{}: {error}", dir.display())),
    }
}

pub async fn template_check(target: &Target<'_>) -> CheckResult {
    let description = "template renders against live state";
    let res = match crate::model(target.marathon, target.weights).await {
        Ok(model) => crate::render(target.template_path, &model).await,
        Err(error) => Err(error),
    };
    match res {
        Ok(_) => CheckResult::ok(description),
        Err(error) => CheckResult::failed(description, format!("{error:#}")).with_hint(TROUBLESHOOTING),
    }
}

pub async fn run_checks(target: &Target<'_>) -> Vec<CheckResult> {
    let mut results = Vec::new();
    if target.marathon.endpoints().is_empty() {
        results.push(CheckResult::failed(
            "marathon endpoints are configured",
            "no endpoints given",
        ));
    }
    let mut reachable = false;
    for endpoint in target.marathon.endpoints() {
        let result = endpoint_check(target.marathon, endpoint).await;
        reachable |= result.success();
        results.push(result);
    }
    results.push(output_dir_check(target.output_path).await);

    // Rendering needs live state from at least one endpoint.
    if reachable {
        results.push(template_check(target).await);
    }
    results
}

pub fn print_checks(results: &[CheckResult]) -> bool {
    let mut success = true;
    println!("{CATEGORY}");
    println!("{}", "-".repeat(CATEGORY.len()));
    for result in results {
        match result.result {
            CheckStatus::Success => {
                println!("{CHECK} {}", result.description);
            }
            CheckStatus::Error => {
                success = false;
                println!("{EX} {}", result.description);
                if let Some(error) = &result.error {
                    println!("    {error}");
                }
                if let Some(hint) = result.hint {
                    println!("    see {hint} for hints");
                }
            }
        }
    }

    println!();
    let symbol = if success { CHECK } else { EX };
    println!("Status check results are {symbol}");
    success
}

pub fn json_print_checks(results: &[CheckResult]) -> Result<bool> {
    let success = results.iter().all(CheckResult::success);
    let output = CheckOutput {
        success,
        categories: vec![Category {
            category_name: CATEGORY,
            checks: results,
        }],
    };
    serde_json::to_writer_pretty(std::io::stdout(), &output)?;
    println!();
    Ok(success)
}
