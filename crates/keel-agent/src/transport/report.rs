use crate::transport::json_repair::{RepairAction, repair_and_parse};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

/// How a committed report was recovered from the model's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportSource {
    /// Explicit `agent__final_report` tool call.
    ToolCall,
    /// Wrapper markup found in the response text.
    TextExtracted,
    /// Built by the runner itself, e.g. chat-mode acceptance.
    Synthetic,
}

impl ReportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportSource::ToolCall => "tool-call",
            ReportSource::TextExtracted => "text-extracted",
            ReportSource::Synthetic => "synthetic",
        }
    }
}

/// A validated final report.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalReport {
    pub format: String,
    pub content: String,
    /// Parsed payload for JSON-backed formats; None for plain text formats.
    pub parsed: Option<Value>,
    pub repairs: Vec<RepairAction>,
}

/// Validate `content` against the rules of `format`, producing a report
/// ready to commit. Unknown formats are treated as plain text.
pub fn validate_report(format: &str, content: &str) -> Result<FinalReport, String> {
    match format {
        "json" => {
            let (parsed, repairs) = repair_and_parse(content)
                .map_err(|error| format!("report is not valid JSON: {error}"))?;
            Ok(FinalReport {
                format: format.to_string(),
                content: content.to_string(),
                parsed: Some(parsed),
                repairs,
            })
        }
        "slack-block-kit" => {
            let (parsed, repairs) = repair_and_parse(content)
                .map_err(|error| format!("block kit payload is not valid JSON: {error}"))?;
            let blocks = parsed
                .as_array()
                .ok_or_else(|| "block kit payload must be a JSON array".to_string())?;
            for (index, block) in blocks.iter().enumerate() {
                let object = block
                    .as_object()
                    .ok_or_else(|| format!("block {index} is not an object"))?;
                if !object.get("type").is_some_and(Value::is_string) {
                    return Err(format!("block {index} is missing a string 'type'"));
                }
            }
            Ok(FinalReport {
                format: format.to_string(),
                content: content.to_string(),
                parsed: Some(parsed),
                repairs,
            })
        }
        _ => {
            if content.trim().is_empty() {
                return Err("report content is empty".to_string());
            }
            Ok(FinalReport {
                format: format.to_string(),
                content: content.to_string(),
                parsed: None,
                repairs: Vec::new(),
            })
        }
    }
}

/// Holds the committed report for one session. Commit is last-write-wins:
/// a second commit replaces the first in full, source included. No merging.
#[derive(Default)]
pub struct FinalReportManager {
    committed: Mutex<Option<(FinalReport, ReportSource)>>,
}

impl FinalReportManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit(&self, report: FinalReport, source: ReportSource) {
        tracing::debug!(
            format = %report.format,
            source = source.as_str(),
            "final report committed"
        );
        *self.lock() = Some((report, source));
    }

    pub fn report(&self) -> Option<FinalReport> {
        self.lock().as_ref().map(|(report, _)| report.clone())
    }

    pub fn source(&self) -> Option<ReportSource> {
        self.lock().as_ref().map(|(_, source)| *source)
    }

    pub fn is_committed(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(FinalReport, ReportSource)>> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn markdown_report_rejects_empty_content() {
        assert!(validate_report("markdown", "   \n").is_err());
        assert!(validate_report("markdown", "# Done").is_ok());
    }

    #[test]
    fn json_report_is_repaired_then_parsed() {
        let report = validate_report("json", r#"{"status":"ok",}"#).expect("repairable");
        assert_eq!(report.parsed, Some(json!({"status": "ok"})));
        assert_eq!(report.repairs, vec![RepairAction::RemovedTrailingCommas]);
    }

    #[test]
    fn block_kit_requires_array_of_typed_objects() {
        let valid = r#"[{"type":"section","text":{"type":"mrkdwn","text":"hi"}}]"#;
        assert!(validate_report("slack-block-kit", valid).is_ok());

        assert!(validate_report("slack-block-kit", r#"{"type":"section"}"#).is_err());
        assert!(validate_report("slack-block-kit", r#"[{"text":"untyped"}]"#).is_err());
    }

    #[test]
    fn commit_twice_keeps_only_second_report() {
        let manager = FinalReportManager::new();
        manager.commit(
            validate_report("markdown", "first").expect("valid"),
            ReportSource::TextExtracted,
        );
        manager.commit(
            validate_report("markdown", "second").expect("valid"),
            ReportSource::ToolCall,
        );

        let report = manager.report().expect("committed report");
        assert_eq!(report.content, "second");
        assert_eq!(manager.source(), Some(ReportSource::ToolCall));
    }
}
