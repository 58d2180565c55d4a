use serde_json::Value;

/// One normalization applied to a payload before it parsed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairAction {
    StrippedCodeFence,
    StrippedWrapperNoise,
    NormalizedLineContinuations,
    RemovedTrailingCommas,
}

/// Parse `text` as JSON, applying a fixed sequence of repairs when the raw
/// text does not parse. Each applied repair is recorded; pristine input
/// reports zero repairs. The error returned is from the final parse attempt.
pub fn repair_and_parse(text: &str) -> Result<(Value, Vec<RepairAction>), serde_json::Error> {
    let mut repairs = Vec::new();
    let mut candidate = text.trim().to_string();

    if let Ok(value) = serde_json::from_str(&candidate) {
        return Ok((value, repairs));
    }

    if let Some(stripped) = strip_code_fence(&candidate) {
        candidate = stripped;
        repairs.push(RepairAction::StrippedCodeFence);
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Ok((value, repairs));
        }
    }

    if let Some(stripped) = strip_wrapper_noise(&candidate) {
        candidate = stripped;
        repairs.push(RepairAction::StrippedWrapperNoise);
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Ok((value, repairs));
        }
    }

    if candidate.contains("\\\n") {
        candidate = candidate.replace("\\\n", "");
        repairs.push(RepairAction::NormalizedLineContinuations);
        if let Ok(value) = serde_json::from_str(&candidate) {
            return Ok((value, repairs));
        }
    }

    let without_commas = remove_trailing_commas(&candidate);
    if without_commas != candidate {
        candidate = without_commas;
        repairs.push(RepairAction::RemovedTrailingCommas);
    }

    serde_json::from_str(&candidate).map(|value| (value, repairs))
}

/// Remove a surrounding markdown code fence (``` or ```json).
fn strip_code_fence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix("```")?;
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    let inner = rest.strip_suffix("```").unwrap_or(rest);
    Some(inner.trim().to_string())
}

/// Cut the text down to the outermost JSON object or array, dropping prose
/// or tag fragments around it.
fn strip_wrapper_noise(text: &str) -> Option<String> {
    let open = text.find(['{', '['])?;
    let opener = text.as_bytes()[open];
    let closer = if opener == b'{' { '}' } else { ']' };
    let close = text.rfind(closer)?;
    if close <= open {
        return None;
    }
    let inner = &text[open..=close];
    if inner.len() == text.trim().len() {
        return None;
    }
    Some(inner.to_string())
}

/// Drop commas that directly precede a closing brace or bracket, skipping
/// string literals so embedded text is untouched.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next_meaningful = chars[i + 1..].iter().find(|n| !n.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pristine_json_records_no_repairs() {
        let (value, repairs) =
            repair_and_parse(r#"{"data":{"value":"ok"}}"#).expect("valid json");
        assert_eq!(value, json!({"data": {"value": "ok"}}));
        assert!(repairs.is_empty());
    }

    #[test]
    fn trailing_comma_is_removed_and_recorded() {
        let (value, repairs) = repair_and_parse(r#"{"a":1,}"#).expect("repairable json");
        assert_eq!(value, json!({"a": 1}));
        assert_eq!(repairs, vec![RepairAction::RemovedTrailingCommas]);
    }

    #[test]
    fn code_fence_is_stripped() {
        let (value, repairs) =
            repair_and_parse("```json\n{\"a\": true}\n```").expect("fenced json");
        assert_eq!(value, json!({"a": true}));
        assert_eq!(repairs, vec![RepairAction::StrippedCodeFence]);
    }

    #[test]
    fn prose_around_object_is_stripped() {
        let (value, _) =
            repair_and_parse("Here is the result: {\"n\": 3} hope that helps").expect("json");
        assert_eq!(value, json!({"n": 3}));
    }

    #[test]
    fn backslash_newline_continuations_are_joined() {
        let (value, repairs) =
            repair_and_parse("{\"a\": \"one \\\ntwo\"}").expect("continued json");
        assert_eq!(value, json!({"a": "one two"}));
        assert!(repairs.contains(&RepairAction::NormalizedLineContinuations));
    }

    #[test]
    fn comma_inside_string_survives() {
        let (value, _) = repair_and_parse(r#"{"a": "x,}", "b": 1,}"#).expect("json");
        assert_eq!(value, json!({"a": "x,}", "b": 1}));
    }

    #[test]
    fn unrepairable_text_reports_final_error() {
        assert!(repair_and_parse("not json at all").is_err());
    }
}
