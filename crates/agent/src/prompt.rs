//! System prompt and environment details.

use std::path::Path;
use tasklane_core::mode::Mode;
use tasklane_core::tool::ToolRegistry;
use tasklane_tools::list_files;

const TOOL_USE_INTRO: &str = "\
====

TOOL USE

You have access to a set of tools that are executed upon the user's approval. You can use one tool per message, and will receive the result of that tool use in the user's response. Use tools step by step, each use informed by the result of the previous one.

Tool uses are formatted using XML-style tags. The tool name is enclosed in opening and closing tags, and each parameter is similarly enclosed within its own set of tags:

<tool_name>
<parameter1_name>value1</parameter1_name>
<parameter2_name>value2</parameter2_name>
</tool_name>

Always adhere to this format for the tool use to ensure proper parsing and execution.

# Tools
";

const RULES: &str = "\
====

RULES

- All file paths are relative to the workspace root.
- Use exactly one tool per message and wait for its result before continuing.
- Never assume a tool succeeded; the user's response carries the result.
- When the task is done, use attempt_completion. Do not end the result with a question or an offer of further help.
- Use ask_followup_question only when the information cannot be found with the other tools.
- Use new_task to delegate a self-contained piece of work to another mode.";

/// Build the system prompt for `mode`. Only tools the mode allows are listed.
pub fn system_prompt(
    mode: &Mode,
    modes: &[Mode],
    tools: &ToolRegistry,
    workspace: &Path,
    custom_instructions: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str(&mode.role_definition);
    prompt.push_str("\n\n");
    prompt.push_str(TOOL_USE_INTRO);

    for tool in tools.tools().iter().filter(|t| mode.allows(t.group())) {
        prompt.push('\n');
        prompt.push_str(&tool.usage());
    }

    prompt.push_str("\n====\n\nMODES\n\n");
    for m in modes {
        prompt.push_str(&format!("- \"{}\" ({}): {}\n", m.slug, m.name, m.role_definition));
    }

    prompt.push_str(&format!(
        "\n====\n\nSYSTEM INFORMATION\n\nOperating System: {}\nWorkspace: {}\n\n",
        std::env::consts::OS,
        workspace.display()
    ));
    prompt.push_str(RULES);

    if let Some(instructions) = custom_instructions.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\n====\n\nUSER'S CUSTOM INSTRUCTIONS\n\n");
        prompt.push_str(instructions);
    }
    prompt
}

/// Environment summary appended to the first user message of a task (and to
/// the resumption message). `include_files` adds a top-level listing.
pub fn environment_details(workspace: &Path, mode: &Mode, include_files: bool) -> String {
    let mut out = String::from("<environment_details>\n");
    out.push_str(&format!(
        "# Current Time\n{}\n\n# Current Mode\n<slug>{}</slug>\n<name>{}</name>\n",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S %:z"),
        mode.slug,
        mode.name
    ));

    if include_files {
        let mut entries = Vec::new();
        let truncated = list_files::walk(workspace, workspace, false, &mut entries);
        out.push_str(&format!("\n# Workspace Files ({})\n", workspace.display()));
        if entries.is_empty() {
            out.push_str("(No files found.)\n");
        } else {
            out.push_str(&entries.join("\n"));
            out.push('\n');
            if truncated {
                out.push_str("(File list truncated.)\n");
            }
        }
    }
    out.push_str("</environment_details>");
    out
}
