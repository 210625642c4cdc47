use crate::crew::{CrewKind, CrewRequest, RepositoryContext};

pub const VERDICT_MARKER: &str = "VERDICT:";
pub const FILES_MARKER: &str = "FILES:";

fn preamble(ctx: &RepositoryContext) -> String {
    format!(
        "You are Shepherd, an expert software engineer working in a local git checkout of `{repo}` on branch `{branch}`. \
All paths you pass to tools are relative to the repository root.",
        repo = ctx.repo_path.display(),
        branch = ctx.branch,
    )
}

pub fn system_prompt(kind: CrewKind, ctx: &RepositoryContext) -> String {
    let role = match kind {
        CrewKind::Research => format!(
            r#"## Role
You are the researcher. Analyze the codebase to find exactly where and how the task should be implemented. You cannot modify files.

## Instructions
1. Explore the project structure to understand the architecture.
2. Find similar implementations or patterns already in the codebase.
3. Identify the files that need to be modified or created.
4. Note risks or edge cases the implementer should handle.

## Output
Finish with a research report: project structure summary, implementation approach, and file:line locations for the changes.
End the report with one line listing the files to modify, e.g.
{FILES_MARKER} src/lib.rs, src/config.rs"#
        ),
        CrewKind::Implementation => r#"## Role
You are the implementer. Make the code changes that complete the task.

## Guidelines
- Read code before changing it and follow the existing style and patterns.
- Make minimal, focused changes. Do not touch unrelated files.
- Do not commit; version control is handled for you.
- Use changed_files to check what you have modified so far.

## Output
When you are done, reply with a short summary of the files you changed and why."#
            .to_string(),
        CrewKind::Review => format!(
            r#"## Role
You are the reviewer. The implementer's work is already committed on this branch. Check it for correctness, security, and adherence to the project's conventions. You cannot modify files.

## Instructions
1. Use changed_files to see every file touched since work on the task started, then read those files.
2. Look for bugs, missing edge cases, and style violations.

## Output
Start your final reply with exactly one of these lines:
{VERDICT_MARKER} PASS
{VERDICT_MARKER} NEEDS_CHANGES
Follow it with a summary of your findings and specific file:line issues, if any."#
        ),
    };

    format!("{}\n\n{role}", preamble(ctx))
}

/// The commit and file list the implementation stage produced.
fn changes_section(changes: Option<&serde_json::Value>) -> String {
    let commit = changes
        .and_then(|c| c.get("commit"))
        .and_then(|c| c.as_str());
    let files: Vec<String> = changes
        .and_then(|c| c.get("files"))
        .and_then(|f| f.as_array())
        .map(|files| {
            files
                .iter()
                .filter_map(|f| {
                    let path = f.get("path")?.as_str()?;
                    let kind = f.get("kind").and_then(|k| k.as_str()).unwrap_or("changed");
                    Some(format!("- {path} ({kind})"))
                })
                .collect()
        })
        .unwrap_or_default();

    match commit {
        Some(sha) => format!("## Committed changes\nCommit {sha}:\n{}", files.join("\n")),
        None => "## Committed changes\nThe implementer left the tree unchanged.".to_string(),
    }
}

/// The first user message for a crew invocation.
pub fn task_message(kind: CrewKind, request: &CrewRequest) -> String {
    let task = &request.task_description;
    match kind {
        CrewKind::Research => format!("Research how to implement the following task:\n\n{task}"),
        CrewKind::Implementation => {
            let findings = request
                .prior("research")
                .and_then(|r| r.get("findings"))
                .and_then(|f| f.as_str());
            match findings {
                Some(findings) => format!(
                    "Implement the following task:\n\n{task}\n\n## Research findings\n{findings}"
                ),
                None => format!(
                    "Implement the following task:\n\n{task}\n\nNo research was done beforehand; explore only as much as the change needs."
                ),
            }
        }
        CrewKind::Review => {
            let summary = request
                .prior("implement")
                .and_then(|r| r.get("summary"))
                .and_then(|s| s.as_str())
                .unwrap_or("(no summary provided)");
            format!(
                "Review the changes made on this branch for this task:\n\n{task}\n\n## Implementer's summary\n{summary}\n\n{}",
                changes_section(request.prior("changes"))
            )
        }
    }
}
