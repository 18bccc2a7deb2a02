//! Orchestration for a single session: one iteration of the outer loop.
//!
//! Opens a session row, assembles bounded context, invokes the agent, and
//! observes its event stream. All agent-initiated writes arrive through the
//! control tool surface (a separate store connection); this module only
//! reads state before and after the run and reconciles claimed against
//! verified completions. Any failure between invocation and reconciliation
//! collapses into the failure path: auto-note, failed session row, and
//! released in-progress features, so the next iteration re-selects the same
//! batch.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::core::events::{AgentEvent, ContentBlock, ResultEvent, claims_completion};
use crate::core::types::{NoteScope, SessionClose, SessionStatus};
use crate::io::config::OrchestratorConfig;
use crate::io::context::{ContextBuilder, ContextInputs};
use crate::io::executor::{AgentExecutor, AgentInvocation};
use crate::io::paths::ProjectPaths;
use crate::io::session_log::SessionLog;
use crate::io::store::Store;

/// Inputs shared by every session in a run.
#[derive(Debug, Clone)]
pub struct SessionRequest<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a OrchestratorConfig,
    pub model: Option<String>,
    pub headless: bool,
}

/// What one iteration did, success or failure.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: i64,
    pub status: SessionStatus,
    /// Feature ids selected into the batch, ascending.
    pub attempted: Vec<i64>,
    /// Name of the batch's first feature, for progress lines.
    pub first_feature: String,
    /// Completions asserted by the agent's tool calls. Informational only.
    pub claimed: u32,
    /// Completed-count delta across the session. Authoritative.
    pub verified: u32,
    pub cost: f64,
    /// Global completed / total feature counts after the session.
    pub completed_total: u32,
    pub feature_total: u32,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct StreamObserver {
    claimed: u32,
    input_tokens: u64,
    output_tokens: u64,
    cost: f64,
    result: Option<ResultEvent>,
}

/// Execute exactly one iteration of the outer loop.
///
/// The caller guarantees pending work exists. Iteration-level failures are
/// absorbed into a `Failed` outcome; only store failures during the failure
/// path itself propagate as errors.
pub fn run_session<E: AgentExecutor>(
    store: &mut Store,
    executor: &E,
    request: &SessionRequest<'_>,
) -> Result<SessionOutcome> {
    let config = request.config;
    let batch = store.next_batch(config.batch_size)?;
    if batch.is_empty() {
        bail!("no pending work to schedule");
    }
    let category = batch[0].category.clone();
    let first_feature = batch[0].name.clone();
    let attempted: Vec<i64> = batch.iter().map(|f| f.id).collect();

    let session_id = store.start_session()?;
    let pre_completed = store.kanban_stats()?.total.completed;
    let mut log = SessionLog::create(&request.paths.session_log_path(session_id))?;
    log.line(&format!(
        "session {session_id}: category {category}, features {attempted:?}"
    ))?;
    info!(
        session_id,
        category = %category,
        batch = attempted.len(),
        next = %first_feature,
        "starting session"
    );

    let mut observer = StreamObserver::default();

    let attempt = (|| -> Result<()> {
        let stats = store.kanban_stats()?;
        let notes = store.recent_notes(&category, config.context_notes)?;
        let prompt = ContextBuilder::new(config.prompt_budget_bytes).build(&ContextInputs {
            category: &category,
            features: &batch,
            progress: stats.total,
            notes: &notes,
            port: config.port,
        });

        let invocation = AgentInvocation {
            workdir: request.paths.root.clone(),
            prompt,
            env: session_env(request, session_id),
            model: request.model.clone(),
            timeout: (config.session_timeout_secs > 0)
                .then(|| Duration::from_secs(config.session_timeout_secs)),
            output_limit_bytes: config.output_limit_bytes,
        };

        executor.run(&invocation, &mut |event| {
            observe_event(event, &mut observer, &mut log)
        })?;

        let result = observer
            .result
            .as_ref()
            .ok_or_else(|| anyhow!("agent exited without a result event"))?;
        if !result.is_success() {
            bail!("agent reported result '{}'", result.subtype);
        }
        Ok(())
    })();

    let post = store.kanban_stats()?;
    let verified = post.total.completed.saturating_sub(pre_completed);

    match attempt {
        Ok(()) => {
            if observer.claimed != verified {
                warn!(
                    session_id,
                    claimed = observer.claimed,
                    verified,
                    "agent-claimed completions differ from verified count"
                );
                log.line(&format!(
                    "runner: agent claimed {} completions, verified {verified}",
                    observer.claimed
                ))?;
            }
            let close = SessionClose {
                status: SessionStatus::Completed,
                features_attempted: attempted.len() as u32,
                features_completed: verified,
                input_tokens: observer.input_tokens,
                output_tokens: observer.output_tokens,
                cost: observer.cost,
                error: None,
            };
            store.end_session(session_id, &close)?;
            log.stats_block(&close)?;
            Ok(SessionOutcome {
                session_id,
                status: SessionStatus::Completed,
                attempted,
                first_feature,
                claimed: observer.claimed,
                verified,
                cost: observer.cost,
                completed_total: post.total.completed,
                feature_total: post.total.total(),
                error: None,
            })
        }
        Err(err) => {
            let message = format!("{err:#}");
            warn!(session_id, error = %message, "session failed");

            let note = format!(
                "Session {session_id} failed while working on {attempted:?}. Error: {message}. See session log."
            );
            if let Err(note_err) = store.add_note(&NoteScope::Global, &note, Some(session_id)) {
                warn!(session_id, error = %format!("{note_err:#}"), "failed to record crash note");
            }

            // Release anything the crashed attempt left in_progress so the
            // next iteration re-selects the same batch.
            let released = store.reset_orphans()?;
            if released > 0 {
                debug!(session_id, released, "released in-progress features");
            }

            let close = SessionClose {
                status: SessionStatus::Failed,
                features_attempted: attempted.len() as u32,
                features_completed: verified,
                input_tokens: observer.input_tokens,
                output_tokens: observer.output_tokens,
                cost: observer.cost,
                error: Some(message.clone()),
            };
            store.end_session(session_id, &close)?;
            log.stats_block(&close)?;
            Ok(SessionOutcome {
                session_id,
                status: SessionStatus::Failed,
                attempted,
                first_feature,
                claimed: observer.claimed,
                verified,
                cost: observer.cost,
                completed_total: post.total.completed,
                feature_total: post.total.total(),
                error: Some(message),
            })
        }
    }
}

fn session_env(request: &SessionRequest<'_>, session_id: i64) -> Vec<(String, String)> {
    let mut env = vec![
        (
            "FOREMAN_PROJECT_DIR".to_string(),
            request.paths.root.display().to_string(),
        ),
        ("FOREMAN_SESSION_ID".to_string(), session_id.to_string()),
        ("FOREMAN_PORT".to_string(), request.config.port.to_string()),
        (
            "FOREMAN_HEADLESS".to_string(),
            if request.headless { "1" } else { "0" }.to_string(),
        ),
    ];
    env.push((
        "FOREMAN_TEMPLATE_DIR".to_string(),
        request
            .config
            .template_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default(),
    ));
    env
}

fn observe_event(
    event: &AgentEvent,
    observer: &mut StreamObserver,
    log: &mut SessionLog,
) -> Result<()> {
    match event {
        AgentEvent::System(init) => {
            debug!(agent_session = %init.session_id, model = %init.model, "agent initialized");
            log.line(&format!(
                "system: agent session {} model {}",
                init.session_id, init.model
            ))?;
        }
        AgentEvent::Assistant { message } => {
            for block in &message.content {
                match block {
                    ContentBlock::Text { text } => log.line(&format!("agent: {text}"))?,
                    ContentBlock::ToolUse { name, input } => {
                        if claims_completion(block) {
                            observer.claimed += 1;
                        }
                        log.line(&format!("tool: {name} {input}"))?;
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        AgentEvent::Result(result) => {
            observer.input_tokens = result.usage.input_tokens;
            observer.output_tokens = result.usage.output_tokens;
            observer.cost = result.total_cost_usd;
            observer.result = Some(result.clone());
            log.line(&format!(
                "result: {} (tokens in {}, out {}, cost ${:.4})",
                result.subtype,
                result.usage.input_tokens,
                result.usage.output_tokens,
                result.total_cost_usd
            ))?;
        }
        AgentEvent::Other => debug!("skipped unrecognized agent event"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FeatureStatus;
    use crate::test_support::{
        ScriptedAction, ScriptedExecutor, ScriptedSession, completing_session, crashing_session,
        ev_result_success, init_project, spec,
    };
    use std::fs;

    fn request<'a>(
        paths: &'a ProjectPaths,
        config: &'a OrchestratorConfig,
    ) -> SessionRequest<'a> {
        SessionRequest {
            paths,
            config,
            model: None,
            headless: true,
        }
    }

    /// Happy path: the agent completes the whole batch, the session row
    /// records verified counts and usage, and the log has a stats block.
    #[test]
    fn session_completes_batch_and_records_verified_stats() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(
            temp.path(),
            &[spec(1, "a", "cat-x"), spec(2, "b", "cat-x"), spec(3, "c", "cat-x")],
        )
        .expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let config = OrchestratorConfig::default();

        let executor = ScriptedExecutor::new(vec![completing_session(&[1, 2, 3])]);
        let outcome =
            run_session(&mut store, &executor, &request(&paths, &config)).expect("session");

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.attempted, vec![1, 2, 3]);
        assert_eq!(outcome.verified, 3);
        assert_eq!(outcome.claimed, 3);

        let row = store.session(outcome.session_id).expect("row");
        assert_eq!(row.status, SessionStatus::Completed);
        assert_eq!(row.features_attempted, 3);
        assert_eq!(row.features_completed, 3);
        assert!(row.input_tokens > 0);

        let log = fs::read_to_string(paths.session_log_path(outcome.session_id)).expect("log");
        assert!(log.contains("=== session stats ==="));
    }

    /// The agent claims a completion that never committed; the verified
    /// count wins and the divergence is logged.
    #[test]
    fn claimed_completions_are_not_trusted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let config = OrchestratorConfig::default();

        // A bare tool_use event without a store write behind it.
        let executor = ScriptedExecutor::new(vec![ScriptedSession {
            actions: vec![
                ScriptedAction::Event(crate::test_support::ev_tool_use(
                    "feature_status",
                    serde_json::json!({"id": 1, "status": "completed"}),
                )),
                ScriptedAction::Event(ev_result_success(100, 50, 0.1)),
            ],
            error: None,
        }]);

        let outcome =
            run_session(&mut store, &executor, &request(&paths, &config)).expect("session");
        assert_eq!(outcome.claimed, 1);
        assert_eq!(outcome.verified, 0);
        let row = store.session(outcome.session_id).expect("row");
        assert_eq!(row.features_completed, 0);

        let log = fs::read_to_string(paths.session_log_path(outcome.session_id)).expect("log");
        assert!(log.contains("claimed 1 completions, verified 0"));
    }

    /// B4/S4: the agent dies without a result event. The session is failed,
    /// a global auto-note names the batch, and no feature status changes.
    #[test]
    fn crash_without_result_event_fails_session_with_auto_note() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(
            temp.path(),
            &[
                spec(1, "a", "cat-x"),
                spec(2, "b", "cat-x"),
                spec(3, "c", "cat-x"),
                spec(4, "d", "cat-x"),
                spec(5, "e", "cat-x"),
            ],
        )
        .expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let config = OrchestratorConfig::default();

        let executor = ScriptedExecutor::new(vec![crashing_session("agent crashed")]);
        let outcome =
            run_session(&mut store, &executor, &request(&paths, &config)).expect("session");

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.verified, 0);
        let row = store.session(outcome.session_id).expect("row");
        assert_eq!(row.status, SessionStatus::Failed);
        assert!(row.error.as_deref().unwrap_or_default().contains("agent crashed"));

        let notes = store.notes_for(None, None).expect("notes");
        assert_eq!(notes.len(), 1);
        assert!(notes[0].content.contains("[1, 2, 3]"));
        assert!(notes[0].content.contains("agent crashed"));

        for id in 1..=5 {
            assert_eq!(
                store.feature(id).expect("read").expect("present").status,
                FeatureStatus::Pending
            );
        }
    }

    /// A crash after marking a feature in_progress must not leak the
    /// in_progress status into the next iteration.
    #[test]
    fn crash_after_in_progress_releases_the_feature() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let config = OrchestratorConfig::default();

        let executor = ScriptedExecutor::new(vec![ScriptedSession {
            actions: vec![ScriptedAction::tool(
                "feature_status",
                serde_json::json!({"id": 1, "status": "in_progress"}),
            )],
            error: Some("agent crashed mid-feature".to_string()),
        }]);

        let outcome =
            run_session(&mut store, &executor, &request(&paths, &config)).expect("session");
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(
            store.feature(1).expect("read").expect("present").status,
            FeatureStatus::Pending
        );
        let batch = store.next_batch(3).expect("batch");
        assert_eq!(batch[0].id, 1);
    }

    /// An error-subtype result fails the iteration even on a clean exit.
    #[test]
    fn error_result_subtype_fails_the_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &[spec(1, "a", "cat-x")]).expect("init");
        let mut store = Store::open_existing(&paths.db_path).expect("store");
        let config = OrchestratorConfig::default();

        let executor = ScriptedExecutor::new(vec![ScriptedSession {
            actions: vec![ScriptedAction::Event(
                crate::test_support::ev_result_error("error_max_turns"),
            )],
            error: None,
        }]);

        let outcome =
            run_session(&mut store, &executor, &request(&paths, &config)).expect("session");
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert!(
            outcome
                .error
                .as_deref()
                .unwrap_or_default()
                .contains("error_max_turns")
        );
    }
}
