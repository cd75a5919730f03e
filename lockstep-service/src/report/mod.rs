// Pipeline Reporter
// Renders a pipeline result as JUnit XML, JSON, or terminal text

use crate::execution::aggregate::PipelineResult;
use crate::execution::results::{JobResult, Status, SuiteResult};

use std::fmt;

/// Output format for reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// JUnit XML, one testsuite per job and one testcase per suite
    JUnit,
    Json,
    /// Human-readable terminal output
    Terminal,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::JUnit => write!(f, "junit"),
            ReportFormat::Json => write!(f, "json"),
            ReportFormat::Terminal => write!(f, "terminal"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "junit" | "junit-xml" | "xml" => Ok(ReportFormat::JUnit),
            "json" => Ok(ReportFormat::Json),
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: junit, json, terminal",
                s
            )),
        }
    }
}

/// Generates pipeline reports in various formats
pub struct Reporter;

impl Reporter {
    pub fn report(result: &PipelineResult, format: ReportFormat) -> Result<String, serde_json::Error> {
        match format {
            ReportFormat::JUnit => Ok(Self::to_junit_xml(result)),
            ReportFormat::Json => Self::to_json(result),
            ReportFormat::Terminal => Ok(Self::to_terminal(result)),
        }
    }

    pub fn to_json(result: &PipelineResult) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(result)
    }

    /// Generate JUnit XML output
    ///
    /// A job that failed before its suites ran gets an extra `setup` testcase
    /// carrying the error, so CI dashboards show why nothing was tested.
    pub fn to_junit_xml(result: &PipelineResult) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");

        let totals = result.jobs.iter().map(JobCounts::of).fold(JobCounts::default(), JobCounts::add);
        xml.push_str(&format!(
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.3}\">\n",
            xml_escape(&result.pipeline),
            totals.tests,
            totals.failures,
            totals.errors,
            totals.skipped,
            result.duration.as_secs_f64()
        ));

        for job in &result.jobs {
            Self::push_job(&mut xml, job);
        }

        xml.push_str("</testsuites>\n");
        xml
    }

    fn push_job(xml: &mut String, job: &JobResult) {
        let counts = JobCounts::of(job);
        xml.push_str(&format!(
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.3}\">\n",
            xml_escape(&job.name),
            counts.tests,
            counts.failures,
            counts.errors,
            counts.skipped,
            job.duration.as_secs_f64()
        ));

        if let Some(message) = setup_error(job) {
            xml.push_str(&format!(
                "    <testcase name=\"setup\" classname=\"{}\" time=\"0.000\">\n",
                xml_escape(&job.name)
            ));
            xml.push_str(&format!(
                "      <error message=\"{}\" />\n",
                xml_escape(&message)
            ));
            xml.push_str("    </testcase>\n");
        }

        for suite in &job.suites {
            Self::push_suite(xml, &job.name, suite);
        }

        xml.push_str("  </testsuite>\n");
    }

    fn push_suite(xml: &mut String, classname: &str, suite: &SuiteResult) {
        xml.push_str(&format!(
            "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\"",
            xml_escape(&suite.name),
            xml_escape(classname),
            suite.duration.as_secs_f64()
        ));

        match suite.status {
            Status::Succeeded => xml.push_str(" />\n"),
            Status::Skipped => {
                xml.push_str(">\n");
                xml.push_str(&format!(
                    "      <skipped message=\"{}\" />\n",
                    xml_escape(suite.skip_reason.as_deref().unwrap_or("skipped"))
                ));
                xml.push_str("    </testcase>\n");
            }
            Status::Failed => {
                xml.push_str(">\n");
                let message = if suite.timed_out {
                    "timed out".to_string()
                } else {
                    match suite.exit_code {
                        Some(code) => format!("exited with {}", code),
                        None => "did not run to completion".to_string(),
                    }
                };
                xml.push_str(&format!(
                    "      <failure message=\"{}\">{}</failure>\n",
                    xml_escape(&message),
                    xml_escape(&suite.command)
                ));
                if !suite.stdout.is_empty() {
                    xml.push_str(&format!(
                        "      <system-out>{}</system-out>\n",
                        xml_escape(&suite.stdout)
                    ));
                }
                if !suite.stderr.is_empty() {
                    xml.push_str(&format!(
                        "      <system-err>{}</system-err>\n",
                        xml_escape(&suite.stderr)
                    ));
                }
                xml.push_str("    </testcase>\n");
            }
        }
    }

    /// Generate human-readable terminal output
    pub fn to_terminal(result: &PipelineResult) -> String {
        let mut out = String::new();

        out.push_str(&format!("\nPipeline: {}\n", result.pipeline));
        out.push_str(&"=".repeat(60));
        out.push('\n');

        for job in &result.jobs {
            let (symbol, status) = if job.success {
                ("+", "PASS")
            } else {
                ("x", "FAIL")
            };
            out.push_str(&format!(
                "  [{}] {} ({:.2}s) {}\n",
                symbol,
                status,
                job.duration.as_secs_f64(),
                job.name
            ));
            if let Some(failure) = &job.failure {
                out.push_str(&format!("       {}\n", failure));
            }
            for suite in &job.suites {
                out.push_str(&format!("       {:<10} {}\n", suite.status, suite.name));
            }
            if let Some(error) = &job.cleanup_error {
                out.push_str(&format!("       cleanup: {}\n", error));
            }
        }

        out.push_str(&"-".repeat(60));
        out.push('\n');

        let failed = result.failed_jobs().count();
        let status_line = if result.success {
            format!(
                "  All {} jobs passed ({:.2}s)",
                result.jobs.len(),
                result.duration.as_secs_f64()
            )
        } else {
            format!(
                "  {} of {} jobs failed ({:.2}s)",
                failed,
                result.jobs.len(),
                result.duration.as_secs_f64()
            )
        };
        out.push_str(&status_line);
        out.push('\n');
        out
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct JobCounts {
    tests: usize,
    failures: usize,
    errors: usize,
    skipped: usize,
}

impl JobCounts {
    fn of(job: &JobResult) -> Self {
        let setup = usize::from(setup_error(job).is_some());
        Self {
            tests: job.suites.len() + setup,
            failures: job.suites.iter().filter(|s| s.status == Status::Failed).count(),
            errors: setup,
            skipped: job.suites.iter().filter(|s| s.status == Status::Skipped).count(),
        }
    }

    fn add(self, other: Self) -> Self {
        Self {
            tests: self.tests + other.tests,
            failures: self.failures + other.failures,
            errors: self.errors + other.errors,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// Failure that happened before the test phase, if any
fn setup_error(job: &JobResult) -> Option<String> {
    use crate::execution::results::JobFailure;

    match &job.failure {
        Some(JobFailure::Suites { .. }) | None => None,
        Some(failure) => Some(failure.to_string()),
    }
}

/// Escape special XML characters
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
