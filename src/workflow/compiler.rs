//! ワークフローコンパイラー
//!
//! (リクエスト, 解決済みコンテキスト) を順序付きの [`Step`] 列に変換します。
//! I/O も待機もない純粋関数で、同じ入力からは常に同じステップ列を返します。
//!
//! - Initialize / Extend: プロンプトステップ1つ、続いて任意でマッピング・統合ステップ
//! - Recompute: 指定種別のステップを1つだけ、凍結済みのバッチ出力を入力に生成

use thiserror::Error;

use crate::model::{ProviderContexts, StepType, WorkflowRequest};
use super::resolver::{RecomputeContext, ResolvedContext};
use super::step::{Step, StepInput, StepPayload};

/// コンパイルエラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// リクエストが不正
    #[error("不正なリクエスト: {0}")]
    InvalidRequest(String),

    /// リクエストとコンテキストの種別が一致しない
    #[error("リクエスト({request})とコンテキスト({context})の種別が一致しません")]
    ContextMismatch {
        request: &'static str,
        context: &'static str,
    },
}

fn request_kind(request: &WorkflowRequest) -> &'static str {
    match request {
        WorkflowRequest::Initialize(_) => "initialize",
        WorkflowRequest::Extend(_) => "extend",
        WorkflowRequest::Recompute(_) => "recompute",
    }
}

fn context_kind(context: &ResolvedContext) -> &'static str {
    match context {
        ResolvedContext::Initialize => "initialize",
        ResolvedContext::Extend(_) => "extend",
        ResolvedContext::Recompute(_) => "recompute",
    }
}

/// リクエストをステップ列にコンパイルする
///
/// # 例
///
/// ```rust
/// use turnflow::model::{InitializeRequest, WorkflowRequest};
/// use turnflow::workflow::{compile, ResolvedContext};
///
/// let request = WorkflowRequest::Initialize(InitializeRequest {
///     user_message: "Rust の所有権を説明して".to_string(),
///     provider_ids: vec!["claude".to_string(), "codex".to_string()],
///     mapping_provider: None,
///     synthesis_provider: Some("claude".to_string()),
/// });
///
/// let steps = compile(&request, &ResolvedContext::Initialize).unwrap();
/// let ids: Vec<&str> = steps.iter().map(|s| s.step_id.as_str()).collect();
/// assert_eq!(ids, vec!["prompt-0", "synthesis-1"]);
/// ```
pub fn compile(request: &WorkflowRequest, context: &ResolvedContext) -> Result<Vec<Step>, CompileError> {
    request.validate().map_err(CompileError::InvalidRequest)?;

    match (request, context) {
        (WorkflowRequest::Initialize(req), ResolvedContext::Initialize) => Ok(compile_turn(
            &req.user_message,
            &req.provider_ids,
            ProviderContexts::new(),
            req.mapping_provider.as_deref(),
            req.synthesis_provider.as_deref(),
        )),
        (WorkflowRequest::Extend(req), ResolvedContext::Extend(ctx)) => {
            // 今回要求されたプロバイダーのコンテキストだけを継続に使う
            let contexts = ctx
                .inherited_provider_contexts
                .iter()
                .filter(|(provider_id, _)| req.provider_ids.contains(*provider_id))
                .map(|(provider_id, value)| (provider_id.clone(), value.clone()))
                .collect();
            Ok(compile_turn(
                &req.user_message,
                &req.provider_ids,
                contexts,
                req.mapping_provider.as_deref(),
                req.synthesis_provider.as_deref(),
            ))
        }
        (WorkflowRequest::Recompute(req), ResolvedContext::Recompute(ctx)) => {
            if req.step_type != ctx.step_type || req.target_provider != ctx.target_provider {
                return Err(CompileError::InvalidRequest(
                    "リクエストとコンテキストの対象ステップが一致しません".to_string(),
                ));
            }
            compile_recompute(ctx).map(|step| vec![step])
        }
        (request, context) => Err(CompileError::ContextMismatch {
            request: request_kind(request),
            context: context_kind(context),
        }),
    }
}

fn compile_turn(
    user_message: &str,
    provider_ids: &[String],
    provider_contexts: ProviderContexts,
    mapping_provider: Option<&str>,
    synthesis_provider: Option<&str>,
) -> Vec<Step> {
    let mut steps = vec![Step::new(
        0,
        StepPayload::Prompt {
            prompt: user_message.to_string(),
            provider_ids: provider_ids.to_vec(),
            provider_contexts,
        },
    )];
    let prompt_step_id = steps[0].step_id.clone();

    let mut mapping_step_id = None;
    if let Some(provider_id) = mapping_provider {
        let step = Step::new(
            steps.len(),
            StepPayload::Mapping {
                provider_id: provider_id.to_string(),
                original_prompt: user_message.to_string(),
                input: StepInput::FromStep(prompt_step_id.clone()),
                provider_context: None,
            },
        );
        mapping_step_id = Some(step.step_id.clone());
        steps.push(step);
    }

    if let Some(provider_id) = synthesis_provider {
        steps.push(Step::new(
            steps.len(),
            StepPayload::Synthesis {
                provider_id: provider_id.to_string(),
                original_prompt: user_message.to_string(),
                input: StepInput::FromStep(prompt_step_id),
                mapping: mapping_step_id.map(StepInput::FromStep),
                provider_context: None,
            },
        ));
    }

    steps
}

fn compile_recompute(ctx: &RecomputeContext) -> Result<Step, CompileError> {
    let provider_context = ctx.provider_contexts_at_source_turn.get(&ctx.target_provider).cloned();
    let input = StepInput::Frozen(ctx.frozen_batch_outputs.clone());

    let payload = match ctx.step_type {
        StepType::Mapping => StepPayload::Mapping {
            provider_id: ctx.target_provider.clone(),
            original_prompt: ctx.user_message.clone(),
            input,
            provider_context,
        },
        StepType::Synthesis => StepPayload::Synthesis {
            provider_id: ctx.target_provider.clone(),
            original_prompt: ctx.user_message.clone(),
            input,
            mapping: (!ctx.frozen_mapping_outputs.is_empty())
                .then(|| StepInput::Frozen(ctx.frozen_mapping_outputs.clone())),
            provider_context,
        },
        StepType::Prompt => {
            return Err(CompileError::InvalidRequest(
                "Recompute できるのは mapping / synthesis ステップのみです".to_string(),
            ));
        }
    };
    Ok(Step::new(0, payload))
}
