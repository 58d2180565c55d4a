use crate::accounting::AccountingEntry;
use crate::events::{EventKind, now_ms};
use crate::guard::ContextGuard;
use crate::session::Session;
use crate::session::failures::{
    FAILURE_EMPTY_OUTPUT, FAILURE_FINAL_REPORT_INVALID, FAILURE_FINAL_REPORT_MISSING,
    FAILURE_FINAL_TURN_NO_REPORT, FAILURE_NO_TOOLS, FAILURE_UNEXPECTED_STOP_REASON,
    FAILURE_UNKNOWN_TOOL, FailurePriority, TurnFailure, corrective_message, select_corrective,
};
use crate::session::types::{SessionResult, SessionStatus};
use crate::tools::{FINAL_REPORT_TOOL, ToolOutcome, final_report_schema};
use crate::transport::{
    FinalReport, ReportSource, TransportParser, evaluate_meta_blocks, generate_nonce,
    render_protocol_instructions, repair_and_parse, validate_report,
};
use futures::future::join_all;
use keel_llm::{
    ChunkSink, LlmErrorKind, Message, ToolCall, TurnRequest, TurnStatus, Usage,
};
use keel_store::{CacheEntry, content_hash};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

enum TurnOutcome {
    Committed,
    Advance,
    Fatal(String),
    Canceled,
}

impl Session {
    /// Drive the session to completion. Never returns an error: every
    /// failure mode is folded into the result's `success`/`error` fields.
    pub async fn run(self) -> SessionResult {
        self.emit(
            EventKind::SessionStart,
            &[("call_path", json!(self.trace.call_path))],
        );
        for (queue, capacity) in &self.config.queue_capacities {
            self.queues.configure(queue, *capacity);
        }

        let guard = ContextGuard::new(self.config.token_budget, self.config.force_final_percent);
        let mut history = self.initial_messages.clone();
        let max_turns = self.config.max_turns.max(1);
        let mut turns_used = 0usize;

        let (status, error) = loop {
            if self.targets.is_empty() {
                break (
                    SessionStatus::Failed,
                    Some("no model targets configured".to_string()),
                );
            }
            if self.abort.is_aborted() {
                break (
                    SessionStatus::Canceled,
                    Some("session canceled".to_string()),
                );
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break (
                    SessionStatus::Stopping,
                    Some("stopped before a final report was committed".to_string()),
                );
            }
            if turns_used >= max_turns {
                break (
                    SessionStatus::Failed,
                    Some("max_turns_exhausted".to_string()),
                );
            }

            let turn = turns_used + 1;
            let used_tokens = guard.estimate_conversation_tokens(&history, self.tokenizer.as_ref());
            let is_final = guard.should_force_final(used_tokens) || turn == max_turns;
            self.emit(
                EventKind::TurnStart,
                &[
                    ("turn", json!(turn)),
                    ("is_final", json!(is_final)),
                    ("used_tokens", json!(used_tokens)),
                ],
            );

            match self.run_turn(is_final, &mut history).await {
                TurnOutcome::Committed => {
                    turns_used = turn;
                    break (SessionStatus::Completed, None);
                }
                TurnOutcome::Advance => turns_used = turn,
                TurnOutcome::Fatal(reason) => {
                    turns_used = turn;
                    break (SessionStatus::Failed, Some(reason));
                }
                TurnOutcome::Canceled => {
                    turns_used = turn;
                    break (
                        SessionStatus::Canceled,
                        Some("session canceled".to_string()),
                    );
                }
            }
        };

        let success = status == SessionStatus::Completed;
        self.emit(
            EventKind::SessionEnd,
            &[
                ("status", json!(status.as_str())),
                ("success", json!(success)),
                ("turns_used", json!(turns_used)),
            ],
        );

        SessionResult {
            success,
            status,
            final_report: self.report.report(),
            report_source: self.report.source(),
            conversation: history,
            accounting: self.accounting.snapshot(),
            error,
            turns_used,
        }
    }

    async fn run_turn(&self, is_final: bool, history: &mut Vec<Message>) -> TurnOutcome {
        let max_retries = self.config.max_retries.max(1);
        for attempt in 1..=max_retries {
            if self.abort.is_aborted() {
                return TurnOutcome::Canceled;
            }

            // Retries rotate through the configured targets.
            let target = &self.targets[(attempt - 1) % self.targets.len()];
            let Some(provider) = self.providers.resolve(Some(&target.provider)) else {
                return TurnOutcome::Fatal(format!(
                    "provider '{}' is not registered",
                    target.provider
                ));
            };

            let nonce = generate_nonce();
            let parser = TransportParser::new(&nonce);
            let mut messages = history.clone();
            messages.push(Message::system(render_protocol_instructions(
                &nonce,
                &self.config.output_format,
                &self.meta_plugins,
            )));
            // A final turn advertises only the report tool.
            let mut tools = if is_final {
                Vec::new()
            } else {
                self.tools.schemas()
            };
            tools.push(final_report_schema(&self.config.output_format));

            let request = TurnRequest {
                model: target.model.clone(),
                messages,
                tools,
                sampling: self.config.sampling,
                streaming: self.config.streaming,
                is_final_turn: is_final,
                chunk_sink: Some(self.streaming_sink()),
            };

            let started = Instant::now();
            let invocation = tokio::select! {
                result = provider.execute_turn(request) => result,
                _ = self.abort.aborted() => return TurnOutcome::Canceled,
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let result = match invocation {
                Ok(result) => result,
                Err(error) => {
                    self.accounting.append(AccountingEntry::Llm {
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        usage: Usage::default(),
                        latency_ms,
                        status: error.kind.as_str().to_string(),
                    });
                    self.emit(
                        EventKind::Error,
                        &[
                            ("kind", json!(error.kind.as_str())),
                            ("message", json!(error.message)),
                        ],
                    );
                    if !error.is_retryable() {
                        return TurnOutcome::Fatal(error.to_string());
                    }
                    if attempt == max_retries {
                        return TurnOutcome::Fatal(format!("retries_exhausted: {error}"));
                    }
                    self.emit_retry(attempt, error.kind.as_str());
                    continue;
                }
            };

            self.accounting.append(AccountingEntry::Llm {
                provider: target.provider.clone(),
                model: target.model.clone(),
                usage: result.usage,
                latency_ms,
                status: turn_status_str(result.status).to_string(),
            });
            self.emit(
                EventKind::Accounting,
                &[
                    ("provider", json!(target.provider)),
                    ("total_tokens", json!(result.usage.total_tokens)),
                ],
            );

            if result.status != TurnStatus::Success {
                let retryable = LlmErrorKind::try_from(result.status)
                    .map(|kind| kind.default_retryable())
                    .unwrap_or(true);
                let reason = format!(
                    "provider returned {}: {}",
                    turn_status_str(result.status),
                    result.text()
                );
                if !retryable {
                    return TurnOutcome::Fatal(reason);
                }
                if attempt == max_retries {
                    return TurnOutcome::Fatal(format!("retries_exhausted: {reason}"));
                }
                self.emit_retry(attempt, turn_status_str(result.status));
                continue;
            }

            let text = result.text();
            self.emit(EventKind::AssistantOutput, &[("text", json!(text))]);
            let parsed = parser.parse(&text);

            if self.config.chat_mode {
                let accepted =
                    result.stop_reason.as_deref() == Some("stop") && !text.trim().is_empty();
                history.extend(result.messages.clone());
                if accepted {
                    self.commit_report(
                        FinalReport {
                            format: self.config.output_format.clone(),
                            content: text,
                            parsed: None,
                            repairs: Vec::new(),
                        },
                        ReportSource::Synthetic,
                    );
                    return TurnOutcome::Committed;
                }
                let failure = if text.trim().is_empty() {
                    TurnFailure::new(
                        FAILURE_EMPTY_OUTPUT,
                        FailurePriority::High,
                        "the response contained no output text",
                    )
                } else {
                    TurnFailure::new(
                        FAILURE_UNEXPECTED_STOP_REASON,
                        FailurePriority::Normal,
                        format!(
                            "finish reason was {:?}, expected 'stop'",
                            result.stop_reason
                        ),
                    )
                };
                if attempt == max_retries {
                    return TurnOutcome::Fatal(format!("retries_exhausted: {}", failure.slug));
                }
                history.push(Message::user(corrective_message(&[failure.clone()])));
                self.emit_retry(attempt, &failure.slug);
                continue;
            }

            let mut failures: Vec<TurnFailure> =
                parsed.issues.iter().map(TurnFailure::from_issue).collect();
            failures.extend(parsed.meta_issues.iter().map(TurnFailure::from_issue));
            failures.extend(
                evaluate_meta_blocks(&self.meta_plugins, &parsed.meta_blocks)
                    .iter()
                    .map(TurnFailure::from_issue),
            );

            let mut calls = result.tool_calls();
            calls.extend(parsed.tool_calls.iter().cloned());
            let (report_calls, work_calls): (Vec<ToolCall>, Vec<ToolCall>) = calls
                .into_iter()
                .partition(|call| call.name == FINAL_REPORT_TOOL);

            // Report recovery, three paths in order: explicit tool call,
            // wrapper markup, best-effort JSON from free text.
            let mut committed = false;
            if let Some(call) = report_calls.last() {
                match self.report_from_call(call) {
                    Ok(report) => {
                        self.commit_report(report, ReportSource::ToolCall);
                        committed = true;
                    }
                    Err(reason) => failures.push(TurnFailure::new(
                        FAILURE_FINAL_REPORT_INVALID,
                        FailurePriority::High,
                        reason,
                    )),
                }
            }
            if !committed {
                if let Some(candidate) = &parsed.report {
                    let format = candidate
                        .format
                        .as_deref()
                        .unwrap_or(&self.config.output_format);
                    match validate_report(format, &candidate.content) {
                        Ok(report) => {
                            self.commit_report(report, ReportSource::TextExtracted);
                            committed = true;
                        }
                        Err(reason) => failures.push(TurnFailure::new(
                            FAILURE_FINAL_REPORT_INVALID,
                            FailurePriority::High,
                            reason,
                        )),
                    }
                }
            }
            // Free text is only mined for JSON on a final turn that issued
            // no work calls; mid-session JSON is usually tool input or
            // scratch work, not a report.
            if !committed && is_final && work_calls.is_empty() {
                if let Some(report) = self.recover_report_from_text(&text) {
                    self.commit_report(report, ReportSource::TextExtracted);
                    committed = true;
                }
            }

            let mut new_messages = result.messages.clone();
            let mut dispatched_any = false;
            if !is_final && !work_calls.is_empty() {
                let (known, unknown): (Vec<ToolCall>, Vec<ToolCall>) = work_calls
                    .iter()
                    .cloned()
                    .partition(|call| self.tools.contains(&call.name));
                for call in &unknown {
                    failures.push(TurnFailure::new(
                        FAILURE_UNKNOWN_TOOL,
                        FailurePriority::High,
                        format!("tool '{}' is not registered", call.name),
                    ));
                    new_messages.push(Message::tool_result(
                        call.id.clone(),
                        format!("unknown tool '{}'", call.name),
                    ));
                }

                let outcomes =
                    join_all(known.iter().map(|call| self.dispatch_tool_call(call))).await;
                for (call, outcome) in known.iter().zip(outcomes) {
                    new_messages.push(Message::tool_result(call.id.clone(), outcome.text));
                }
                dispatched_any = !known.is_empty();

                if self.abort.is_aborted() {
                    history.extend(new_messages);
                    return TurnOutcome::Canceled;
                }
            }

            if !committed
                && !is_final
                && work_calls.is_empty()
                && report_calls.is_empty()
                && parsed.report.is_none()
            {
                let slug = if self.tools.is_empty() {
                    FAILURE_FINAL_REPORT_MISSING
                } else {
                    FAILURE_NO_TOOLS
                };
                failures.push(TurnFailure::new(
                    slug,
                    FailurePriority::High,
                    "the response contained neither tool calls nor a final report",
                ));
            }
            if !committed && is_final {
                failures.push(TurnFailure::fatal(
                    FAILURE_FINAL_TURN_NO_REPORT,
                    FailurePriority::Critical,
                    "the final turn must produce a valid final report",
                ));
            }

            history.extend(new_messages);

            if committed {
                return TurnOutcome::Committed;
            }
            if failures.is_empty() && dispatched_any {
                return TurnOutcome::Advance;
            }

            if let Some(fatal) = failures.iter().find(|failure| failure.fatal) {
                return TurnOutcome::Fatal(format!("{}: {}", fatal.slug, fatal.detail));
            }
            if attempt == max_retries {
                let slugs: Vec<String> = select_corrective(&failures)
                    .into_iter()
                    .map(|failure| failure.slug)
                    .collect();
                return TurnOutcome::Fatal(format!("retries_exhausted: {}", slugs.join(", ")));
            }
            history.push(Message::user(corrective_message(&failures)));
            self.emit_retry(
                attempt,
                &failures
                    .first()
                    .map(|failure| failure.slug.clone())
                    .unwrap_or_default(),
            );
        }

        TurnOutcome::Fatal("retries_exhausted".to_string())
    }

    /// Streaming chunks flow to the caller's sink and onto the event channel.
    fn streaming_sink(&self) -> ChunkSink {
        let emitter = self.emitter.clone();
        let session_id = self.id.clone();
        let inner = self.chunk_sink.clone();
        Arc::new(move |chunk: &str| {
            emitter.emit(crate::events::SessionEvent::with_fields(
                EventKind::AssistantChunk,
                session_id.clone(),
                &[("text", json!(chunk))],
            ));
            if let Some(sink) = &inner {
                sink(chunk);
            }
        })
    }

    /// Execute one known tool call: queue slot, optional cache, accounting.
    async fn dispatch_tool_call(&self, call: &ToolCall) -> ToolOutcome {
        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutcome::failure(format!("unknown tool '{}'", call.name), 0);
        };
        let queue = tool.queue.clone();
        let executor = tool.executor.clone();
        let bytes_in = call.arguments.to_string().len();
        self.emit(
            EventKind::ToolCallStart,
            &[
                ("tool", json!(call.name)),
                ("call_id", json!(call.id)),
                ("queue", json!(queue)),
            ],
        );

        let cache_key = self.tool_cache_key(call);
        if let (Some(cache), Some(key)) = (&self.tool_cache, &cache_key) {
            if let Ok(Some(entry)) = cache.get(key, now_ms()).await {
                let text = String::from_utf8_lossy(&entry.payload).to_string();
                self.record_tool_entry(&queue, &call.name, bytes_in, text.len(), 0, "cached");
                return ToolOutcome::success(text, 0);
            }
        }

        let grant = match self.queues.acquire(&queue, &self.abort).await {
            Ok(grant) => grant,
            Err(error) => {
                self.record_tool_entry(&queue, &call.name, bytes_in, 0, 0, "aborted");
                return ToolOutcome::failure(error.to_string(), 0);
            }
        };
        if grant.queued {
            tracing::debug!(
                tool = %call.name,
                queue = %queue,
                wait_ms = grant.wait_ms,
                "tool call waited for a queue slot"
            );
        }

        let started = Instant::now();
        let mut outcome = executor.execute(call).await;
        self.queues.release(&queue);
        outcome.latency_ms = started.elapsed().as_millis() as u64;

        if outcome.ok {
            if let (Some(cache), Some(key), Some(ttl)) = (
                &self.tool_cache,
                &cache_key,
                self.config.tool_cache_ttl_ms,
            ) {
                let entry = CacheEntry::with_key(
                    key.clone(),
                    outcome.text.clone().into_bytes(),
                    "tool_result",
                    now_ms(),
                    ttl,
                );
                if let Err(error) = cache.set(entry).await {
                    tracing::warn!(tool = %call.name, %error, "tool cache write failed");
                    self.emit(
                        EventKind::Warning,
                        &[
                            ("tool", json!(call.name)),
                            ("message", json!(error.to_string())),
                        ],
                    );
                }
            }
        }

        let status = if outcome.ok { "ok" } else { "error" };
        self.record_tool_entry(
            &queue,
            &call.name,
            bytes_in,
            outcome.text.len(),
            outcome.latency_ms,
            status,
        );
        self.emit(
            EventKind::ToolCallEnd,
            &[
                ("tool", json!(call.name)),
                ("call_id", json!(call.id)),
                ("ok", json!(outcome.ok)),
                ("latency_ms", json!(outcome.latency_ms)),
            ],
        );
        outcome
    }

    fn report_from_call(&self, call: &ToolCall) -> Result<FinalReport, String> {
        let format = call
            .arguments
            .get("report_format")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.output_format);
        let content = call
            .arguments
            .get("report_content")
            .and_then(Value::as_str)
            .ok_or_else(|| "report_content is missing or not a string".to_string())?;
        validate_report(format, content)
    }

    /// Fallback for models that ignore the wrapper: pull a JSON object out
    /// of the free text and treat it as the report.
    fn recover_report_from_text(&self, text: &str) -> Option<FinalReport> {
        let (value, repairs) = repair_and_parse(text).ok()?;
        if let Some(content) = value.get("report_content").and_then(Value::as_str) {
            let format = value
                .get("report_format")
                .and_then(Value::as_str)
                .unwrap_or(&self.config.output_format);
            return validate_report(format, content).ok();
        }
        if matches!(self.config.output_format.as_str(), "json" | "slack-block-kit") {
            let content = serde_json::to_string(&value).ok()?;
            let mut report = validate_report(&self.config.output_format, &content).ok()?;
            report.repairs = repairs;
            return Some(report);
        }
        None
    }

    fn commit_report(&self, report: FinalReport, source: ReportSource) {
        self.emit(
            EventKind::ReportCommitted,
            &[
                ("format", json!(report.format)),
                ("source", json!(source.as_str())),
            ],
        );
        self.report.commit(report, source);
    }

    fn tool_cache_key(&self, call: &ToolCall) -> Option<String> {
        self.config.tool_cache_ttl_ms?;
        self.tool_cache.as_ref()?;
        Some(content_hash(
            format!("{}\n{}", call.name, call.arguments).as_bytes(),
        ))
    }

    fn record_tool_entry(
        &self,
        queue: &str,
        tool: &str,
        bytes_in: usize,
        bytes_out: usize,
        latency_ms: u64,
        status: &str,
    ) {
        self.accounting.append(AccountingEntry::Tool {
            queue: queue.to_string(),
            tool: tool.to_string(),
            bytes_in,
            bytes_out,
            latency_ms,
            status: status.to_string(),
        });
    }

    fn emit(&self, kind: EventKind, fields: &[(&str, Value)]) {
        self.emitter
            .emit(crate::events::SessionEvent::with_fields(
                kind,
                self.id.clone(),
                fields,
            ));
    }

    fn emit_retry(&self, attempt: usize, reason: &str) {
        self.emit(
            EventKind::Retry,
            &[("attempt", json!(attempt)), ("reason", json!(reason))],
        );
    }
}

fn turn_status_str(status: TurnStatus) -> &'static str {
    match status {
        TurnStatus::Success => "success",
        TurnStatus::RateLimit => "rate_limit",
        TurnStatus::AuthError => "auth_error",
        TurnStatus::ModelError => "model_error",
        TurnStatus::NetworkError => "network_error",
        TurnStatus::Timeout => "timeout",
        TurnStatus::QuotaExceeded => "quota_exceeded",
        TurnStatus::InvalidResponse => "invalid_response",
    }
}
