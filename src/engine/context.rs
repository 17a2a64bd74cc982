//! ステップ実行コンテキストの管理
//!
//! # 責務
//!
//! - ステップ実行の進行状況を追跡
//! - 各ステップの結果を保持し、後続ステップへ出力を受け渡す
//! - トークン使用量の累積
//!
//! # 使用例
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//! use turnflow::engine::context::ExecutionContext;
//! use turnflow::engine::result::{StepResult, StepStatus};
//! use turnflow::model::StepType;
//!
//! let mut ctx = ExecutionContext::new("sess-1");
//! ctx.start_step("prompt-0");
//! ctx.record_step_result(StepResult {
//!     step_id: "prompt-0".to_string(),
//!     step_type: StepType::Prompt,
//!     status: StepStatus::Failed,
//!     outputs: BTreeMap::new(),
//!     failures: BTreeMap::new(),
//!     duration: Duration::from_secs(1),
//!     error: Some("全てのプロバイダーが失敗しました".to_string()),
//! });
//!
//! assert!(!ctx.succeeded("prompt-0"));
//! assert!(ctx.outputs_of("prompt-0").is_none());
//! ```

use std::collections::HashMap;

use crate::workflow::StepOutputs;
use super::result::{StepResult, StepStatus};

/// ステップ実行コンテキスト
#[derive(Debug)]
pub struct ExecutionContext {
    session_id: String,

    // ステップ実行履歴
    steps_executed: Vec<String>,
    current_step: Option<String>,

    // ステップ間データ受け渡し
    step_results: HashMap<String, StepResult>,

    total_tokens_used: u32,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            steps_executed: Vec::new(),
            current_step: None,
            step_results: HashMap::new(),
            total_tokens_used: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// ステップ実行を開始
    pub fn start_step(&mut self, step_id: &str) {
        self.current_step = Some(step_id.to_string());
    }

    /// ステップ完了と結果を記録
    pub fn record_step_result(&mut self, result: StepResult) {
        self.total_tokens_used += result.tokens_used();
        self.steps_executed.push(result.step_id.clone());
        self.current_step = None;
        self.step_results.insert(result.step_id.clone(), result);
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// ステップが成功したか
    pub fn succeeded(&self, step_id: &str) -> bool {
        self.step_results
            .get(step_id)
            .is_some_and(|result| result.status == StepStatus::Success)
    }

    /// 成功したステップの出力テキスト
    pub fn outputs_of(&self, step_id: &str) -> Option<StepOutputs> {
        self.step_results
            .get(step_id)
            .filter(|result| result.status == StepStatus::Success)
            .map(StepResult::texts)
    }

    pub fn total_tokens(&self) -> u32 {
        self.total_tokens_used
    }

    /// 実行順のステップ結果を取り出す
    pub fn into_results(mut self) -> Vec<StepResult> {
        self.steps_executed
            .iter()
            .filter_map(|step_id| self.step_results.remove(step_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepType;
    use crate::orchestrator::ProviderOutput;
    use crate::provider::TokenUsage;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn success(step_id: &str, text: &str) -> StepResult {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "a".to_string(),
            ProviderOutput {
                provider_id: "a".to_string(),
                text: text.to_string(),
                provider_context: None,
                model: None,
                token_usage: Some(TokenUsage {
                    input_tokens: 3,
                    output_tokens: 4,
                }),
                latency_ms: 1,
            },
        );
        StepResult {
            step_id: step_id.to_string(),
            step_type: StepType::Prompt,
            status: StepStatus::Success,
            outputs,
            failures: BTreeMap::new(),
            duration: Duration::from_millis(1),
            error: None,
        }
    }

    #[test]
    fn test_record_and_read_outputs() {
        let mut ctx = ExecutionContext::new("sess-1");
        ctx.start_step("prompt-0");
        assert_eq!(ctx.current_step(), Some("prompt-0"));

        ctx.record_step_result(success("prompt-0", "hello"));
        assert!(ctx.current_step().is_none());
        assert!(ctx.succeeded("prompt-0"));
        assert_eq!(ctx.outputs_of("prompt-0").unwrap()["a"], "hello");
        assert_eq!(ctx.total_tokens(), 7);
        assert!(!ctx.succeeded("mapping-1"));
    }

    #[test]
    fn test_into_results_keeps_execution_order() {
        let mut ctx = ExecutionContext::new("sess-1");
        ctx.record_step_result(success("prompt-0", "x"));
        ctx.record_step_result(StepResult::skipped("mapping-1", StepType::Mapping, "upstream".to_string()));
        ctx.record_step_result(success("synthesis-2", "y"));

        let ids: Vec<String> = ctx.into_results().into_iter().map(|r| r.step_id).collect();
        assert_eq!(ids, vec!["prompt-0", "mapping-1", "synthesis-2"]);
    }
}
