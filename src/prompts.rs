// Prompt Registry
//
// Every model-facing prompt is kept under `prompts/` and embedded with
// `include_str!` so the agent's instructions are visible in one place.
//
// Directory layout:
//   prompts/
//   ├── default_system_prompt.md  - Main agent system prompt
//   ├── todo_reminder.md          - Nudge sent when the session has no todos
//   └── todo_continuation.md      - Auto-continuation directive

/// Default system prompt. Placeholder: `{workspace}`
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../prompts/default_system_prompt.md");

/// Reminder injected before a round-trip when the todo list is empty
pub const TODO_REMINDER: &str = include_str!("../prompts/todo_reminder.md");

/// Continuation directive. Placeholders: `{count}`, `{next}`
pub const TODO_CONTINUATION: &str = include_str!("../prompts/todo_continuation.md");

/// Render the default system prompt for a workspace
pub fn system_prompt(workspace: &str) -> String {
    render(DEFAULT_SYSTEM_PROMPT, &[("workspace", workspace)])
}

/// Replace `{key}` placeholders in a template
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{}}}", key), value);
    }
    result
}

/// Wrap content in `<system-reminder>` tags
pub fn wrap_reminder(content: &str) -> String {
    format!("<system-reminder>\n{}\n</system-reminder>", content.trim())
}
