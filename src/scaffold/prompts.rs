//! Prompts for the research agent and the answer grader.

/// System prompt for the search agent.
pub const AGENT_SYSTEM_PROMPT: &str = r#"You are a research assistant that answers questions by searching for and reading sources through tool calls.

## How to work

1. Break the question into the facts you need.
2. Call one tool per turn. Read the result before deciding what to do next.
3. If a tool call fails, check the arguments against the tool schema and try again or try another tool.
4. Stop as soon as you are confident. Do not guess before you have looked.

## Response Format

To call a tool, respond with a single JSON object:

```json
{"tool": "<tool name>", "arguments": {...}}
```

When you know the answer, respond with the answer wrapped in answer tags and nothing else after it:

<answer>your concise final answer</answer>

Keep the final answer short: a name, a number, a date or a short phrase.
"#;

/// Sent once the turn limit is reached without an answer.
pub const FORCE_ANSWER_PROMPT: &str = "You have run out of tool calls. Based only on the information gathered so far, give your best final answer now, wrapped in <answer></answer> tags.";

/// Sent when the agent's reply could not be parsed.
pub const FORMAT_REMINDER_PROMPT: &str = "Your last reply was neither a JSON tool call nor a final answer in <answer></answer> tags. Reply with exactly one of the two.";

/// System prompt for the correctness grader.
pub const GRADER_SYSTEM_PROMPT: &str = r#"You are grading an answer to a question against a reference answer.

Decide whether the predicted answer means the same thing as the reference answer. Ignore differences in capitalization, punctuation, formatting, word order and units that are clearly equivalent. An answer that contains the reference answer plus unrelated or contradicting claims is incorrect.

Reply with a single letter:
A: CORRECT
B: INCORRECT

Do not explain your choice."#;

/// Build the system prompt with the tool list appended.
pub fn build_system_prompt(tools_json: &serde_json::Value) -> String {
    format!(
        "{AGENT_SYSTEM_PROMPT}\n## Available Tools\n\n{}",
        build_tool_prompt(tools_json)
    )
}

/// Build the tool definitions section from the registry's JSON schema.
pub fn build_tool_prompt(tools_json: &serde_json::Value) -> String {
    let tools = tools_json
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let description = function.get("description")?.as_str()?;
                    let params = function.get("parameters")?;

                    Some(format!(
                        "### {}\n\n{}\n\nParameters:\n```json\n{}\n```",
                        name,
                        description,
                        serde_json::to_string_pretty(params).unwrap_or_default()
                    ))
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .unwrap_or_default();

    if tools.is_empty() {
        "No tools are available. Answer from your own knowledge.".to_string()
    } else {
        tools
    }
}

pub fn build_question_prompt(question: &str) -> String {
    format!("Question: {}", question.trim())
}

/// Renders a tool result (or error) as the next user turn.
pub fn format_tool_result(tool: &str, result: Result<&serde_json::Value, &str>) -> String {
    match result {
        Ok(serde_json::Value::String(text)) => format!("Tool '{}' returned:\n{}", tool, text),
        Ok(value) => format!(
            "Tool '{}' returned:\n{}",
            tool,
            serde_json::to_string_pretty(value).unwrap_or_default()
        ),
        Err(error) => format!("Tool '{}' failed: {}", tool, error),
    }
}

pub fn build_grader_prompt(question: &str, reference: &str, predicted: &str) -> String {
    format!(
        "Question: {}\n\nReference answer: {}\n\nPredicted answer: {}\n\nIs the predicted answer correct? Reply A or B.",
        question.trim(),
        reference.trim(),
        predicted.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_system_prompt_lists_tools() {
        let tools = json!([{
            "type": "function",
            "function": {
                "name": "google_search",
                "description": "Search the web",
                "parameters": {"type": "object"}
            }
        }]);
        let prompt = build_system_prompt(&tools);
        assert!(prompt.contains("### google_search"));
        assert!(prompt.contains("<answer>"));
    }

    #[test]
    fn test_build_tool_prompt_empty() {
        assert!(build_tool_prompt(&json!([])).contains("No tools"));
    }

    #[test]
    fn test_format_tool_result() {
        assert_eq!(
            format_tool_result("browse", Ok(&json!("page text"))),
            "Tool 'browse' returned:\npage text"
        );
        assert!(format_tool_result("browse", Err("timed out")).contains("failed: timed out"));
    }

    #[test]
    fn test_grader_prompt() {
        let prompt = build_grader_prompt("Who?", "Ada Lovelace", " Ada ");
        assert!(prompt.contains("Reference answer: Ada Lovelace"));
        assert!(prompt.contains("Predicted answer: Ada\n"));
    }
}
