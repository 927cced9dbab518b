use serde_json::Value;

/// One directive parsed out of a free-text ReAct-style completion.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    ToolCall { name: String, arguments: Value },
    FinalAnswer(String),
}

fn is_directive_line(line: &str) -> bool {
    line.starts_with("Action:") || line.starts_with("Action Input:") || line.starts_with("Final Answer:") || line.starts_with("Thought:")
}

/// Scans `text` line by line and returns the *last* directive encountered —
/// an `Action`/`Action Input` pair, or a `Final Answer` line. Scanning in
/// order and always overwriting the prior directive means a model that
/// second-guesses itself and emits `Final Answer` followed by another
/// `Action` correctly falls through to the action: a final answer only wins
/// when nothing follows it. Returns `None` if the text contains no
/// recognizable directive at all.
pub fn parse_react(text: &str) -> Option<Directive> {
    let lines: Vec<&str> = text.lines().collect();
    let mut pending: Option<Directive> = None;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();

        if let Some(rest) = line.strip_prefix("Action:") {
            let name = rest.trim().to_string();
            let mut j = i + 1;
            let mut input_lines: Vec<String> = Vec::new();

            while j < lines.len() {
                let next = lines[j].trim();
                if let Some(input_rest) = next.strip_prefix("Action Input:") {
                    input_lines.push(input_rest.trim().to_string());
                    j += 1;
                    while j < lines.len() {
                        let l = lines[j].trim();
                        if is_directive_line(l) {
                            break;
                        }
                        input_lines.push(l.to_string());
                        j += 1;
                    }
                    break;
                }
                if is_directive_line(next) {
                    break;
                }
                j += 1;
            }

            if !input_lines.is_empty() {
                let raw = input_lines.join("\n").trim().to_string();
                let arguments = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                pending = Some(Directive::ToolCall { name, arguments });
                i = j;
                continue;
            }
        } else if let Some(rest) = line.strip_prefix("Final Answer:") {
            let mut text_lines = vec![rest.trim().to_string()];
            let mut j = i + 1;
            while j < lines.len() {
                let l = lines[j].trim();
                if is_directive_line(l) {
                    break;
                }
                text_lines.push(l.to_string());
                j += 1;
            }
            let answer = text_lines.join("\n").trim().to_string();
            pending = Some(Directive::FinalAnswer(answer));
            i = j;
            continue;
        }

        i += 1;
    }

    pending
}

/// Whether a `Final Answer` directive is the `ReactTools` termination
/// sentinel rather than real analysis text.
pub fn is_done_sentinel(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("DONE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_action_with_json_input() {
        let text = "Thought: need pod list\nAction: get_pods\nAction Input: {\"namespace\": \"default\"}";
        let directive = parse_react(text).unwrap();
        assert_eq!(
            directive,
            Directive::ToolCall { name: "get_pods".into(), arguments: serde_json::json!({"namespace": "default"}) }
        );
    }

    #[test]
    fn parses_final_answer() {
        let text = "Thought: done investigating\nFinal Answer: the pod is crash-looping due to OOM";
        assert_eq!(parse_react(text).unwrap(), Directive::FinalAnswer("the pod is crash-looping due to OOM".into()));
    }

    #[test]
    fn final_answer_followed_by_action_loses_the_tie() {
        let text = "Final Answer: maybe done\nAction: get_pods\nAction Input: {}";
        let directive = parse_react(text).unwrap();
        assert_eq!(directive, Directive::ToolCall { name: "get_pods".into(), arguments: serde_json::json!({}) });
    }

    #[test]
    fn action_followed_by_final_answer_final_wins() {
        let text = "Action: get_pods\nAction Input: {}\nFinal Answer: actually I'm done";
        assert_eq!(parse_react(text).unwrap(), Directive::FinalAnswer("actually I'm done".into()));
    }

    #[test]
    fn no_directive_returns_none() {
        assert_eq!(parse_react("just rambling with no structure"), None);
    }

    #[test]
    fn done_sentinel_is_case_insensitive() {
        assert!(is_done_sentinel("  done  "));
        assert!(!is_done_sentinel("done investigating"));
    }
}
