//! Per-iteration prompt assembly.
//!
//! A prompt is built from a `prompt.md` template found on a fixed search
//! path, filtered down to the sections meant for the current backend,
//! with `{UPPER_CASE}` variables filled in and any `AGENTS.md` project
//! context injected. A fixed header naming the task files and the
//! completion-marker contract goes on top.
//!
//! Agent-specific sections look like:
//!
//! ```text
//! <!-- agent:claude -->
//! Use the TodoWrite tool to track sub-steps.
//! <!-- /agent:claude -->
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::classifier::COMPLETION_MARKER;
use crate::paths;

const TEMPLATE_FILENAME: &str = "prompt.md";
const AGENTS_FILENAME: &str = "AGENTS.md";

const DEFAULT_TEMPLATE: &str = "\
## Your Task

1. Read the PRD at `{PRD_FILE}` and the progress log at `{PROGRESS_FILE}`.
   Check the `## Codebase Patterns` section of the progress log first.
2. Work on story {STORY_ID} ({STORY_TITLE}): the highest-priority story
   whose `passes` is false.
3. Implement only that story. Keep changes focused.
4. Run the project's quality checks (build, lint, tests) and fix failures.
5. Commit with a message of the form `feat: {STORY_ID} - {STORY_TITLE}`.
6. Set `passes: true` for the story (and its acceptance criteria) in the PRD.
7. Append what you did and what you learned to the progress log. Add
   reusable discoveries to `## Codebase Patterns`.
";

static VARIABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([A-Z][A-Z0-9_]*)\}").unwrap());
static SECTION_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<!-- agent:([A-Za-z0-9_.-]+) -->").unwrap());

/// Values available to a template.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub task_dir: PathBuf,
    pub branch_name: String,
    pub agent: String,
    pub story_id: String,
    pub story_title: String,
    pub extra_vars: BTreeMap<String, String>,
}

impl PromptContext {
    pub fn prd_file(&self) -> PathBuf {
        paths::prd_file(&self.task_dir)
    }

    pub fn progress_file(&self) -> PathBuf {
        paths::progress_file(&self.task_dir)
    }

    pub fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::from([
            ("TASK_DIR".to_string(), self.task_dir.display().to_string()),
            ("PRD_FILE".to_string(), self.prd_file().display().to_string()),
            ("PROGRESS_FILE".to_string(), self.progress_file().display().to_string()),
            ("BRANCH_NAME".to_string(), self.branch_name.clone()),
            ("AGENT".to_string(), self.agent.clone()),
            ("STORY_ID".to_string(), self.story_id.clone()),
            ("STORY_TITLE".to_string(), self.story_title.clone()),
        ]);
        vars.extend(self.extra_vars.clone());
        vars
    }
}

/// Ordered list of places a `prompt.md` template may live.
#[derive(Debug, Clone)]
pub struct TemplateSources {
    pub candidates: Vec<PathBuf>,
}

impl TemplateSources {
    /// Task dir, user config dir, project root, data dir.
    pub fn standard(task_dir: &Path, data_dir: &Path) -> Self {
        let mut candidates = vec![task_dir.join(TEMPLATE_FILENAME)];
        if let Some(home) = std::env::var_os("HOME") {
            candidates.push(
                PathBuf::from(home)
                    .join(".config")
                    .join("ralph")
                    .join(TEMPLATE_FILENAME),
            );
        }
        candidates.push(paths::project_root(task_dir).join(TEMPLATE_FILENAME));
        candidates.push(data_dir.join(TEMPLATE_FILENAME));
        Self { candidates }
    }

    /// First readable template, or the built-in default.
    pub fn load(&self) -> (String, Option<PathBuf>) {
        for path in &self.candidates {
            if let Ok(content) = std::fs::read_to_string(path) {
                debug!(path = %path.display(), "using prompt template");
                return (content, Some(path.clone()));
            }
        }
        (DEFAULT_TEMPLATE.to_string(), None)
    }
}

/// Keep sections tagged for `agent` (markers removed) and drop sections
/// tagged for any other backend. An unclosed section runs to the end.
pub fn filter_agent_sections(content: &str, agent: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(caps) = SECTION_OPEN.captures(rest) {
        let open = caps.get(0).map_or(0..0, |m| m.range());
        let name = caps.get(1).map_or("", |m| m.as_str());
        out.push_str(&rest[..open.start]);
        let body_start = open.end;
        let close_tag = format!("<!-- /agent:{name} -->");
        let (body, after) = match rest[body_start..].find(&close_tag) {
            Some(pos) => (
                &rest[body_start..body_start + pos],
                &rest[body_start + pos + close_tag.len()..],
            ),
            None => (&rest[body_start..], ""),
        };
        if name == agent {
            out.push_str(body);
        }
        rest = after;
    }
    out.push_str(rest);
    out
}

/// Replace `{NAME}` placeholders; unknown names are left untouched.
pub fn substitute_variables(template: &str, vars: &BTreeMap<String, String>) -> String {
    VARIABLE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            vars.get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .to_string()
}

/// Project-level then task-level `AGENTS.md`, joined by a blank line.
pub fn find_agents_md(task_dir: &Path) -> String {
    let root = paths::project_root(task_dir);
    let mut candidates = vec![root.join(AGENTS_FILENAME)];
    let task_agents = task_dir.join(AGENTS_FILENAME);
    if !candidates.contains(&task_agents) {
        candidates.push(task_agents);
    }
    candidates
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn header(ctx: &PromptContext) -> String {
    format!(
        "# Ralph Agent Instructions\n\n\
         Task Directory: {}\n\
         PRD File: {}\n\
         Progress File: {}\n\n\
         When every story in the PRD has `passes: true`, end your reply with \
         {COMPLETION_MARKER} on its own line. Do not print it otherwise.\n\n",
        ctx.task_dir.display(),
        ctx.prd_file().display(),
        ctx.progress_file().display(),
    )
}

/// Assemble the full prompt for one iteration.
pub fn build_prompt(ctx: &PromptContext, sources: &TemplateSources) -> String {
    let (template, _) = sources.load();
    let template = filter_agent_sections(&template, &ctx.agent);
    let template = substitute_variables(&template, &ctx.vars());

    let agents_md = find_agents_md(&ctx.task_dir);
    let agents_section = if agents_md.is_empty() {
        String::new()
    } else {
        format!("## Project Context (from AGENTS.md)\n\n{agents_md}\n\n---\n\n")
    };

    format!("{}{agents_section}{template}\n", header(ctx))
}

/// Put operator messages queued between invocations in front of the prompt.
pub fn prepend_operator_messages(prompt: &str, messages: &[String]) -> String {
    if messages.is_empty() {
        return prompt.to_string();
    }
    let mut out = String::from("## Message from the operator\n\n");
    for message in messages {
        out.push_str(message.trim_end());
        out.push_str("\n\n");
    }
    out.push_str("---\n\n");
    out.push_str(prompt);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn ctx(task_dir: &Path) -> PromptContext {
        PromptContext {
            task_dir: task_dir.to_path_buf(),
            branch_name: "ralph/auth".into(),
            agent: "claude".into(),
            story_id: "US-001".into(),
            story_title: "Login form".into(),
            extra_vars: BTreeMap::new(),
        }
    }

    fn project() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let task_dir = tmp.path().join("tasks").join("auth");
        fs::create_dir_all(&task_dir).unwrap();
        (tmp, task_dir)
    }

    #[test]
    fn sections_for_current_agent_are_kept_without_markers() {
        let content = "common\n<!-- agent:claude -->claude only\n<!-- /agent:claude -->\
                       <!-- agent:opencode -->opencode only\n<!-- /agent:opencode -->tail";
        assert_eq!(
            filter_agent_sections(content, "claude"),
            "common\nclaude only\ntail"
        );
        assert_eq!(
            filter_agent_sections(content, "opencode"),
            "common\nopencode only\ntail"
        );
        assert_eq!(filter_agent_sections(content, "mock"), "common\ntail");
    }

    #[test]
    fn unclosed_section_runs_to_end() {
        assert_eq!(
            filter_agent_sections("a <!-- agent:opencode --> b", "claude"),
            "a "
        );
    }

    #[test]
    fn variables_are_substituted_and_unknown_left_alone() {
        let vars = ctx(Path::new("/p/tasks/auth")).vars();
        let out = substitute_variables(
            "{STORY_ID} on {BRANCH_NAME} via {AGENT}; {UNKNOWN} {lower} {\"json\": 1}",
            &vars,
        );
        assert_eq!(
            out,
            "US-001 on ralph/auth via claude; {UNKNOWN} {lower} {\"json\": 1}"
        );
    }

    #[test]
    fn extra_vars_override_builtins() {
        let mut c = ctx(Path::new("/p/tasks/auth"));
        c.extra_vars.insert("AGENT".into(), "override".into());
        assert_eq!(substitute_variables("{AGENT}", &c.vars()), "override");
    }

    #[test]
    fn template_search_order_prefers_task_dir() {
        let (tmp, task_dir) = project();
        fs::write(tmp.path().join("prompt.md"), "root template").unwrap();
        let sources = TemplateSources {
            candidates: vec![task_dir.join("prompt.md"), tmp.path().join("prompt.md")],
        };
        assert_eq!(sources.load().0, "root template");

        fs::write(task_dir.join("prompt.md"), "task template").unwrap();
        let (content, path) = sources.load();
        assert_eq!(content, "task template");
        assert_eq!(path, Some(task_dir.join("prompt.md")));
    }

    #[test]
    fn missing_templates_fall_back_to_default() {
        let (_tmp, task_dir) = project();
        let sources = TemplateSources {
            candidates: vec![task_dir.join("prompt.md")],
        };
        let (content, path) = sources.load();
        assert!(path.is_none());
        assert!(content.contains("{STORY_ID}"));
    }

    #[test]
    fn standard_sources_cover_project_root_and_data_dir() {
        let sources = TemplateSources::standard(Path::new("/p/tasks/auth"), Path::new("/data"));
        assert_eq!(sources.candidates[0], PathBuf::from("/p/tasks/auth/prompt.md"));
        assert!(sources.candidates.contains(&PathBuf::from("/p/prompt.md")));
        assert_eq!(
            sources.candidates.last().unwrap(),
            &PathBuf::from("/data/prompt.md")
        );
    }

    #[test]
    fn agents_md_from_root_and_task_dir() {
        let (tmp, task_dir) = project();
        fs::write(tmp.path().join("AGENTS.md"), "  root rules \n").unwrap();
        fs::write(task_dir.join("AGENTS.md"), "task rules").unwrap();
        assert_eq!(find_agents_md(&task_dir), "root rules\n\ntask rules");
    }

    #[test]
    fn build_prompt_assembles_header_context_and_template() {
        let (tmp, task_dir) = project();
        fs::write(tmp.path().join("AGENTS.md"), "Use cargo nextest.").unwrap();
        fs::write(
            task_dir.join("prompt.md"),
            "Do {STORY_ID}.<!-- agent:opencode --> OC<!-- /agent:opencode -->",
        )
        .unwrap();
        let sources = TemplateSources {
            candidates: vec![task_dir.join("prompt.md")],
        };
        let prompt = build_prompt(&ctx(&task_dir), &sources);

        assert!(prompt.starts_with("# Ralph Agent Instructions\n"));
        assert!(prompt.contains(&format!("PRD File: {}", task_dir.join("prd.json").display())));
        assert!(prompt.contains(COMPLETION_MARKER));
        assert!(prompt.contains("## Project Context (from AGENTS.md)\n\nUse cargo nextest."));
        assert!(prompt.ends_with("Do US-001.\n"));
        assert!(!prompt.contains(" OC"));
    }

    #[test]
    fn operator_messages_go_first() {
        let out = prepend_operator_messages("PROMPT", &["check the flaky test\n".into()]);
        assert!(out.starts_with("## Message from the operator\n\ncheck the flaky test\n\n---\n\n"));
        assert!(out.ends_with("PROMPT"));
        assert_eq!(prepend_operator_messages("PROMPT", &[]), "PROMPT");
    }
}
