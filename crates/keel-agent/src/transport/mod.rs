//! Structure recovery over free-form model text.
//!
//! The model speaks plain text; directives (tool calls, META blocks, the
//! final report) travel inside nonce-tagged wrapper markup. Parsing is
//! heuristic by nature, so every failure mode is enumerated as a named
//! issue slug rather than collapsed into one generic parse error.

pub mod json_repair;
pub mod meta;
pub mod nonce;
pub mod parser;
pub mod report;

pub use json_repair::*;
pub use meta::*;
pub use nonce::*;
pub use parser::*;
pub use report::*;

/// Render the protocol instructions appended as a trailing system message
/// each turn-build, teaching the model the live nonce-tagged wrappers.
pub fn render_protocol_instructions(
    nonce: &str,
    output_format: &str,
    plugins: &[MetaPlugin],
) -> String {
    let mut out = String::new();
    out.push_str(
        "Structured directives must use the exact wrapper tags below. Tags \
         with any other marker are ignored.\n\n",
    );
    out.push_str(&format!(
        "Tool call:\n<AGENT-{nonce}-CALL tool=\"TOOL_NAME\" id=\"CALL_ID\">{{JSON arguments}}</AGENT-{nonce}-CALL>\n\n"
    ));
    out.push_str(&format!(
        "Final report (format: {output_format}):\n<AGENT-{nonce}-REPORT format=\"{output_format}\">report body</AGENT-{nonce}-REPORT>\n"
    ));
    for plugin in plugins {
        let requirement = if plugin.required {
            "required every response"
        } else {
            "optional"
        };
        out.push_str(&format!(
            "\nMETA block '{name}' ({requirement}):\n<AGENT-{nonce}-META plugin=\"{name}\">{{JSON payload}}</AGENT-{nonce}-META>\n",
            name = plugin.name,
        ));
    }
    out
}
