//! Suggested-fix engine: maps a failure context to a remediation hint.
//!
//! A fixed table of builtin patterns covers the common Kubernetes failure
//! modes; monitors can layer custom patterns on top, overriding builtins by
//! name. Candidates are tried in descending priority and the first whose
//! predicate matches wins.

use regex::Regex;
use std::collections::HashSet;
use std::sync::{LazyLock, OnceLock};

/// Returned when no pattern matches.
pub const FALLBACK_SUGGESTION: &str = "Check job logs and events for details.";

/// Everything known about one failed execution that a pattern can match on.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureContext<'a> {
    pub namespace: &'a str,
    pub name: &'a str,
    pub job_name: &'a str,
    pub exit_code: Option<i32>,
    pub reason: &'a str,
    pub logs: &'a str,
    pub events: &'a [String],
}

struct CompiledPredicates {
    reason_re: Option<Regex>,
    log_re: Option<Regex>,
    event_re: Option<Regex>,
}

/// A remediation pattern: a conjunction of optional sub-predicates and the
/// suggestion template to emit when they all hold.
///
/// A sub-predicate that is set must match; absent sub-predicates are
/// ignored. A pattern with no sub-predicates at all never matches.
pub struct FixPattern {
    pub name: String,
    pub exit_code: Option<i32>,
    pub exit_code_range: Option<(i32, i32)>,
    pub reason: Option<String>,
    pub reason_pattern: Option<String>,
    pub log_pattern: Option<String>,
    pub event_pattern: Option<String>,
    pub suggestion: String,
    pub priority: i32,
    compiled: OnceLock<Option<CompiledPredicates>>,
}

impl FixPattern {
    pub fn new(name: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exit_code: None,
            exit_code_range: None,
            reason: None,
            reason_pattern: None,
            log_pattern: None,
            event_pattern: None,
            suggestion: suggestion.into(),
            priority: 0,
            compiled: OnceLock::new(),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Inclusive exit-code range.
    pub fn exit_code_range(mut self, low: i32, high: i32) -> Self {
        self.exit_code_range = Some((low, high));
        self
    }

    /// Case-insensitive reason equality.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn reason_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.reason_pattern = Some(pattern.into());
        self
    }

    pub fn log_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.log_pattern = Some(pattern.into());
        self
    }

    pub fn event_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.event_pattern = Some(pattern.into());
        self
    }

    fn has_predicates(&self) -> bool {
        self.exit_code.is_some()
            || self.exit_code_range.is_some()
            || self.reason.is_some()
            || self.reason_pattern.is_some()
            || self.log_pattern.is_some()
            || self.event_pattern.is_some()
    }

    /// Compile the regex sub-predicates once per pattern. Returns None when
    /// any configured regex fails to compile; such a pattern is skipped.
    fn predicates(&self) -> &Option<CompiledPredicates> {
        self.compiled.get_or_init(|| {
            let compile = |src: &Option<String>| -> Result<Option<Regex>, regex::Error> {
                src.as_deref().map(Regex::new).transpose()
            };
            let reason_re = compile(&self.reason_pattern).ok()?;
            let log_re = compile(&self.log_pattern).ok()?;
            let event_re = compile(&self.event_pattern).ok()?;
            Some(CompiledPredicates {
                reason_re,
                log_re,
                event_re,
            })
        })
    }

    /// Evaluate the conjunction of the pattern's configured sub-predicates.
    pub fn matches(&self, ctx: &FailureContext<'_>) -> bool {
        if !self.has_predicates() {
            return false;
        }
        let Some(predicates) = self.predicates() else {
            return false;
        };

        if let Some(code) = self.exit_code
            && ctx.exit_code != Some(code)
        {
            return false;
        }
        if let Some((low, high)) = self.exit_code_range {
            match ctx.exit_code {
                Some(code) if code >= low && code <= high => {}
                _ => return false,
            }
        }
        if let Some(ref reason) = self.reason
            && !ctx.reason.eq_ignore_ascii_case(reason)
        {
            return false;
        }
        if let Some(ref re) = predicates.reason_re
            && !re.is_match(ctx.reason)
        {
            return false;
        }
        if let Some(ref re) = predicates.log_re
            && !re.is_match(ctx.logs)
        {
            return false;
        }
        if let Some(ref re) = predicates.event_re
            && !ctx.events.iter().any(|event| re.is_match(event))
        {
            return false;
        }
        true
    }
}

/// Substitute the `{Namespace}`/`{Name}`/`{JobName}`/`{ExitCode}`/`{Reason}`
/// placeholders a suggestion may carry.
fn render(suggestion: &str, ctx: &FailureContext<'_>) -> String {
    let exit_code = ctx
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    suggestion
        .replace("{Namespace}", ctx.namespace)
        .replace("{Name}", ctx.name)
        .replace("{JobName}", ctx.job_name)
        .replace("{ExitCode}", &exit_code)
        .replace("{Reason}", ctx.reason)
}

/// The frozen builtin table. Priorities space out the specific failure
/// modes above the two generic exit-code ranges.
static BUILTINS: LazyLock<Vec<FixPattern>> = LazyLock::new(|| {
    vec![
        FixPattern::new(
            "oom-killed",
            "Container in job {JobName} was OOM killed. Raise the job's memory limit or reduce its working set.",
        )
        .priority(100)
        .reason("OOMKilled"),
        FixPattern::new(
            "exit-137",
            "Exit code 137 means the container was killed with SIGKILL, usually by the OOM killer or node pressure. Check memory limits and node events.",
        )
        .priority(95)
        .exit_code(137),
        FixPattern::new(
            "sigterm",
            "Exit code 143 means the container received SIGTERM and did not finish in time. Check activeDeadlineSeconds and handle graceful termination in the process.",
        )
        .priority(90)
        .exit_code(143),
        FixPattern::new(
            "image-pull-backoff",
            "The image for job {JobName} could not be pulled. Verify the image name and tag, and that the pull secret grants registry access.",
        )
        .priority(85)
        .reason_pattern("(?i)(ImagePullBackOff|ErrImagePull)"),
        FixPattern::new(
            "crashloop-backoff",
            "The container is crash-looping at startup. Inspect the container logs for the crash and verify the command and its arguments.",
        )
        .priority(80)
        .reason_pattern("(?i)CrashLoopBackOff"),
        FixPattern::new(
            "container-config-error",
            "The container could not be configured; a referenced ConfigMap or Secret is likely missing in namespace {Namespace}.",
        )
        .priority(75)
        .reason("CreateContainerConfigError"),
        FixPattern::new(
            "deadline-exceeded",
            "The job ran past its activeDeadlineSeconds and was terminated. Raise the deadline or speed up the workload.",
        )
        .priority(70)
        .reason("DeadlineExceeded"),
        FixPattern::new(
            "backoff-limit-exceeded",
            "Every retry failed and the backoffLimit was reached. Check the earliest pod failure for the root cause before re-running.",
        )
        .priority(65)
        .reason("BackoffLimitExceeded"),
        FixPattern::new(
            "evicted",
            "The pod was evicted by node pressure. Set resource requests so the scheduler places it on a node with headroom.",
        )
        .priority(60)
        .reason("Evicted"),
        FixPattern::new(
            "failed-scheduling",
            "The pod could not be scheduled. Check node capacity, taints, and the job's resource requests and node selectors.",
        )
        .priority(55)
        .event_pattern("FailedScheduling"),
        FixPattern::new(
            "app-error",
            "Job {Namespace}/{Name} exited with application error code {ExitCode}. Check the job logs for the failure.",
        )
        .priority(10)
        .exit_code_range(1, 125),
        FixPattern::new(
            "signal-exit",
            "Exit code {ExitCode} indicates the process died on a signal (exit code minus 128). Check for external kills and resource limits.",
        )
        .priority(5)
        .exit_code_range(128, 255),
    ]
});

/// Pick the best remediation hint for a failure.
///
/// Custom patterns override builtins by name. Always returns a non-empty
/// string; with no matching pattern the fixed fallback is returned.
pub fn best_suggestion(ctx: &FailureContext<'_>, custom: &[FixPattern]) -> String {
    let custom_names: HashSet<&str> = custom.iter().map(|p| p.name.as_str()).collect();

    let mut candidates: Vec<&FixPattern> = custom
        .iter()
        .chain(
            BUILTINS
                .iter()
                .filter(|builtin| !custom_names.contains(builtin.name.as_str())),
        )
        .collect();
    // Stable sort keeps custom patterns ahead of builtins at equal priority.
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

    for pattern in candidates {
        if pattern.matches(ctx) {
            return render(&pattern.suggestion, ctx);
        }
    }
    FALLBACK_SUGGESTION.to_string()
}
