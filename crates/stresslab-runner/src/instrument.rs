//! Stress injection: makes a C0 program read its workload size from
//! `--stress <n>` instead of a literal.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const USE_DIRECTIVES: [&str; 3] = ["stress", "conio", "args"];

pub const ENTRY_SIGNATURE: &str = "int main()";

const HELPER_SIGNATURE: &str = "int readStress()";

pub const READ_STRESS_HELPER: &str = "int readStress() {\n    int* value = alloc(int); \n    args_int(\"--stress\", value); \n    args_t input = args_parse(); \n    return *value;\n}\n\n";

/// Which assignments to the stress variable are eligible for rewriting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMatch {
    /// `int stress = ...;` only.
    Typed,
    /// Any `stress = ...;`, declared or not.
    #[default]
    Bare,
}

/// What happens to matching assignments after the first one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAssignments {
    #[default]
    Keep,
    Strip,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstrumentReport {
    pub directives_added: Vec<String>,
    pub helper_inserted: bool,
    pub assignment_replaced: bool,
    pub duplicates_removed: usize,
}

#[derive(Debug, Clone)]
pub struct StressInjection {
    duplicates: DuplicateAssignments,
    assignment: Regex,
    /// Whole later statements, with their indentation and line break.
    statement: Regex,
    replacement: String,
}

impl StressInjection {
    pub fn new(
        variable: &str,
        matching: AssignmentMatch,
        duplicates: DuplicateAssignments,
    ) -> Result<Self> {
        if variable.is_empty() {
            return Err(anyhow!("stress variable name must not be empty"));
        }
        let name = regex::escape(variable);
        let (pattern, statement, replacement) = match matching {
            AssignmentMatch::Typed => (
                format!(r"\bint {} = [^;]+;", name),
                format!(r"(?m)(?:^[ \t]*)?\bint[ \t]+{} = [^;]+;(?:[ \t]*\r?\n)?", name),
                format!("int {} = readStress();", variable),
            ),
            AssignmentMatch::Bare => (
                format!(r"\b{} = [^;]+;", name),
                format!(
                    r"(?m)(?:^[ \t]*)?(?:\bint[ \t]+)?\b{} = [^;]+;(?:[ \t]*\r?\n)?",
                    name
                ),
                format!("{} = readStress();", variable),
            ),
        };
        let assignment = Regex::new(&pattern)
            .with_context(|| format!("compile assignment pattern {}", pattern))?;
        let statement = Regex::new(&statement)
            .with_context(|| format!("compile statement pattern {}", statement))?;
        Ok(Self {
            duplicates,
            assignment,
            statement,
            replacement,
        })
    }

    pub fn apply(&self, source: &str) -> (String, InstrumentReport) {
        let mut report = InstrumentReport::default();
        let mut content = source.to_string();

        for header in USE_DIRECTIVES {
            let directive = format!("#use <{}>\n", header);
            if !content.contains(&directive) {
                content.insert_str(0, &directive);
                report.directives_added.push(header.to_string());
            }
        }

        if !content.contains(HELPER_SIGNATURE) {
            if let Some(pos) = content.find(ENTRY_SIGNATURE) {
                content.insert_str(pos, READ_STRESS_HELPER);
                report.helper_inserted = true;
            }
        }

        if let Some(m) = self.assignment.find(&content) {
            let (start, end) = (m.start(), m.end());
            let tail = &content[end..];
            let tail = match self.duplicates {
                DuplicateAssignments::Keep => tail.to_string(),
                DuplicateAssignments::Strip => {
                    report.duplicates_removed = self.statement.find_iter(tail).count();
                    self.statement.replace_all(tail, "").into_owned()
                }
            };
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&self.replacement);
            out.push_str(&tail);
            content = out;
            report.assignment_replaced = true;
        }

        (content, report)
    }

    /// Reads `input`, rewrites it, and writes the result to `output`. The
    /// input file is never modified.
    pub fn instrument_file(&self, input: &Path, output: &Path) -> Result<InstrumentReport> {
        if same_path(input, output) {
            return Err(anyhow!(
                "refusing to overwrite input in place: {}",
                input.display()
            ));
        }
        let source =
            fs::read_to_string(input).with_context(|| format!("read {}", input.display()))?;
        let (content, report) = self.apply(&source);
        if !report.helper_inserted && !source.contains(HELPER_SIGNATURE) {
            warn!(file = %input.display(), "no `{}` found; helper not inserted", ENTRY_SIGNATURE);
        }
        if !report.assignment_replaced {
            warn!(file = %input.display(), "no stress assignment found");
        }
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(output, content).with_context(|| format!("write {}", output.display()))?;
        Ok(report)
    }
}

/// `foo.verified.c0` becomes `foo.verified.modified.c0`.
pub fn modified_sibling_path(input: &Path) -> Result<PathBuf> {
    let name = input
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow!("not a file path: {}", input.display()))?;
    let stem = name
        .strip_suffix(".c0")
        .ok_or_else(|| anyhow!("expected a .c0 file: {}", input.display()))?;
    Ok(input.with_file_name(format!("{}.modified.c0", stem)))
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
