use crate::transport::json_repair::repair_and_parse;
use keel_llm::ToolCall;
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

pub const ISSUE_MISSING_CLOSING_TAG: &str = "xml_missing_closing_tag";
pub const ISSUE_MALFORMED_MISMATCH: &str = "xml_malformed_mismatch";
pub const META_ISSUE_MISSING: &str = "final_meta_missing";
pub const META_ISSUE_INVALID: &str = "final_meta_invalid";

/// A structural problem found while recovering directives from model text.
/// Issues are collected, never thrown; the runner folds them into
/// turn-failure classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseIssue {
    pub slug: &'static str,
    pub detail: String,
}

impl ParseIssue {
    pub fn new(slug: &'static str, detail: impl Into<String>) -> Self {
        Self {
            slug,
            detail: detail.into(),
        }
    }
}

/// One extracted META block, not yet validated against its plugin schema.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaBlock {
    pub plugin: String,
    pub payload: Value,
}

/// A final-report body recovered from wrapper markup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportCandidate {
    pub format: Option<String>,
    pub content: String,
}

/// Everything recovered from one assistant response. META extraction is
/// out-of-band: a malformed META block lands in `meta_issues` and never
/// aborts tool-call or report extraction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedOutput {
    pub tool_calls: Vec<ToolCall>,
    pub report: Option<ReportCandidate>,
    pub meta_blocks: Vec<MetaBlock>,
    pub issues: Vec<ParseIssue>,
    pub meta_issues: Vec<ParseIssue>,
}

/// Recovers structure from free-form model text. Directive wrappers carry
/// the per-turn nonce in the tag name; tags with any other nonce are quoted
/// examples or stale directives and are flagged, never executed.
pub struct TransportParser {
    nonce: String,
    call_open: Regex,
    report_open: Regex,
    meta_open: Regex,
    any_tag: Regex,
}

impl TransportParser {
    pub fn new(nonce: &str) -> Self {
        let escaped = regex::escape(nonce);
        Self {
            nonce: nonce.to_string(),
            call_open: Regex::new(&format!(
                r#"<AGENT-{escaped}-CALL\s+tool="([^"]+)"(?:\s+id="([^"]+)")?\s*>"#
            ))
            .expect("static tool-call pattern"),
            report_open: Regex::new(&format!(
                r#"<AGENT-{escaped}-REPORT(?:\s+format="([^"]*)")?\s*>"#
            ))
            .expect("static report pattern"),
            meta_open: Regex::new(&format!(
                r#"<AGENT-{escaped}-META\s+plugin="([^"]+)"\s*>"#
            ))
            .expect("static meta pattern"),
            any_tag: Regex::new(r"<AGENT-([A-Za-z0-9]+)-(CALL|REPORT|META)\b")
                .expect("static tag pattern"),
        }
    }

    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn parse(&self, text: &str) -> ParsedOutput {
        let mut output = ParsedOutput::default();
        self.extract_tool_calls(text, &mut output);
        self.extract_report(text, &mut output);
        self.extract_meta(text, &mut output);
        self.flag_foreign_nonces(text, &mut output);
        output
    }

    fn extract_tool_calls(&self, text: &str, output: &mut ParsedOutput) {
        let close_tag = format!("</AGENT-{}-CALL>", self.nonce);
        for captures in self.call_open.captures_iter(text) {
            let open = captures.get(0).expect("whole match");
            let tool = captures[1].to_string();
            let id = captures
                .get(2)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| format!("call-{}", Uuid::new_v4()));

            let Some(rel_close) = text[open.end()..].find(&close_tag) else {
                output.issues.push(ParseIssue::new(
                    ISSUE_MISSING_CLOSING_TAG,
                    format!("tool call '{tool}' has no closing tag"),
                ));
                continue;
            };
            let body = text[open.end()..open.end() + rel_close].trim();
            let arguments = if body.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                match repair_and_parse(body) {
                    Ok((value, _)) => value,
                    Err(error) => {
                        output.issues.push(ParseIssue::new(
                            ISSUE_MALFORMED_MISMATCH,
                            format!("tool call '{tool}' has unparseable arguments: {error}"),
                        ));
                        continue;
                    }
                }
            };
            output.tool_calls.push(ToolCall::new(id, tool, arguments));
        }
    }

    fn extract_report(&self, text: &str, output: &mut ParsedOutput) {
        let close_tag = format!("</AGENT-{}-REPORT>", self.nonce);
        // Last wrapper wins, matching commit semantics downstream.
        for captures in self.report_open.captures_iter(text) {
            let open = captures.get(0).expect("whole match");
            let format = captures.get(1).map(|m| m.as_str().to_string());
            let Some(rel_close) = text[open.end()..].find(&close_tag) else {
                output.issues.push(ParseIssue::new(
                    ISSUE_MISSING_CLOSING_TAG,
                    "final report wrapper has no closing tag".to_string(),
                ));
                continue;
            };
            let content = text[open.end()..open.end() + rel_close].trim().to_string();
            output.report = Some(ReportCandidate { format, content });
        }
    }

    fn extract_meta(&self, text: &str, output: &mut ParsedOutput) {
        let close_tag = format!("</AGENT-{}-META>", self.nonce);
        for captures in self.meta_open.captures_iter(text) {
            let open = captures.get(0).expect("whole match");
            let plugin = captures[1].to_string();
            let Some(rel_close) = text[open.end()..].find(&close_tag) else {
                output.meta_issues.push(ParseIssue::new(
                    META_ISSUE_INVALID,
                    format!("META block '{plugin}' has no closing tag"),
                ));
                continue;
            };
            let body = text[open.end()..open.end() + rel_close].trim();
            match repair_and_parse(body) {
                Ok((payload, _)) => output.meta_blocks.push(MetaBlock { plugin, payload }),
                Err(error) => output.meta_issues.push(ParseIssue::new(
                    META_ISSUE_INVALID,
                    format!("META block '{plugin}' is not valid JSON: {error}"),
                )),
            }
        }
    }

    fn flag_foreign_nonces(&self, text: &str, output: &mut ParsedOutput) {
        for captures in self.any_tag.captures_iter(text) {
            let tag_nonce = &captures[1];
            if tag_nonce != self.nonce {
                output.issues.push(ParseIssue::new(
                    ISSUE_MALFORMED_MISMATCH,
                    format!(
                        "directive tag carries nonce '{tag_nonce}' instead of the current one"
                    ),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NONCE: &str = "t3stN0nce42x";

    fn parser() -> TransportParser {
        TransportParser::new(NONCE)
    }

    #[test]
    fn extracts_tool_call_with_arguments() {
        let text = format!(
            "I'll search first.\n<AGENT-{NONCE}-CALL tool=\"grep\" id=\"c1\">{{\"pattern\": \"fn main\"}}</AGENT-{NONCE}-CALL>"
        );
        let parsed = parser().parse(&text);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "grep");
        assert_eq!(parsed.tool_calls[0].id, "c1");
        assert_eq!(parsed.tool_calls[0].arguments, json!({"pattern": "fn main"}));
        assert!(parsed.issues.is_empty());
    }

    #[test]
    fn missing_call_id_gets_generated() {
        let text =
            format!("<AGENT-{NONCE}-CALL tool=\"read\">{{}}</AGENT-{NONCE}-CALL>");
        let parsed = parser().parse(&text);
        assert!(parsed.tool_calls[0].id.starts_with("call-"));
    }

    #[test]
    fn missing_closing_tag_becomes_issue_not_call() {
        let text = format!("<AGENT-{NONCE}-CALL tool=\"grep\" id=\"c1\">{{}}");
        let parsed = parser().parse(&text);
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.issues[0].slug, ISSUE_MISSING_CLOSING_TAG);
    }

    #[test]
    fn foreign_nonce_is_flagged_and_not_executed() {
        let text = format!(
            "Example syntax: <AGENT-WRONGNONCE99-CALL tool=\"rm\" id=\"x\">{{}}</AGENT-WRONGNONCE99-CALL>\n\
             <AGENT-{NONCE}-CALL tool=\"grep\" id=\"c1\">{{}}</AGENT-{NONCE}-CALL>"
        );
        let parsed = parser().parse(&text);
        let names: Vec<_> = parsed.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["grep"]);
        assert!(
            parsed
                .issues
                .iter()
                .any(|issue| issue.slug == ISSUE_MALFORMED_MISMATCH)
        );
    }

    #[test]
    fn report_wrapper_is_extracted_with_format() {
        let text = format!(
            "<AGENT-{NONCE}-REPORT format=\"markdown\"># Findings\nAll good.</AGENT-{NONCE}-REPORT>"
        );
        let parsed = parser().parse(&text);
        let report = parsed.report.expect("report candidate");
        assert_eq!(report.format.as_deref(), Some("markdown"));
        assert_eq!(report.content, "# Findings\nAll good.");
    }

    #[test]
    fn malformed_meta_does_not_abort_tool_parsing() {
        let text = format!(
            "<AGENT-{NONCE}-META plugin=\"audit\">{{\"never\": \"closed\"\n\
             <AGENT-{NONCE}-CALL tool=\"grep\" id=\"c1\">{{}}</AGENT-{NONCE}-CALL>"
        );
        let parsed = parser().parse(&text);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.meta_issues[0].slug, META_ISSUE_INVALID);
    }

    #[test]
    fn meta_block_json_is_repaired_before_rejection() {
        let text = format!(
            "<AGENT-{NONCE}-META plugin=\"audit\">{{\"score\": 5,}}</AGENT-{NONCE}-META>"
        );
        let parsed = parser().parse(&text);
        assert_eq!(parsed.meta_blocks.len(), 1);
        assert_eq!(parsed.meta_blocks[0].payload, json!({"score": 5}));
        assert!(parsed.meta_issues.is_empty());
    }
}
