//! リクエストプリミティブ
//!
//! ワークフローが受け付けるのは Initialize / Extend / Recompute の3種類だけです。

use serde::{Deserialize, Serialize};

use super::response::ResponseType;
use super::turn::TurnType;

/// ステップ種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// プロバイダーへのファンアウト
    Prompt,
    /// バッチ出力の整理
    Mapping,
    /// バッチ出力の統合
    Synthesis,
}

impl StepType {
    /// このステップが生むレスポンス種別
    pub fn response_type(&self) -> ResponseType {
        match self {
            StepType::Prompt => ResponseType::Batch,
            StepType::Mapping => ResponseType::Mapping,
            StepType::Synthesis => ResponseType::Synthesis,
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::Prompt => write!(f, "prompt"),
            StepType::Mapping => write!(f, "mapping"),
            StepType::Synthesis => write!(f, "synthesis"),
        }
    }
}

/// 新しいセッションを開始するリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeRequest {
    pub user_message: String,
    pub provider_ids: Vec<String>,
    pub mapping_provider: Option<String>,
    pub synthesis_provider: Option<String>,
}

/// 既存セッションを1ターン進めるリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendRequest {
    pub session_id: String,
    pub user_message: String,
    pub provider_ids: Vec<String>,
    pub mapping_provider: Option<String>,
    pub synthesis_provider: Option<String>,
}

/// 過去ターンのステップを1プロバイダーで再実行するリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecomputeRequest {
    pub session_id: String,
    pub source_turn_id: String,
    pub step_type: StepType,
    pub target_provider: String,
}

/// ワークフローリクエスト
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowRequest {
    Initialize(InitializeRequest),
    Extend(ExtendRequest),
    Recompute(RecomputeRequest),
}

impl WorkflowRequest {
    pub fn turn_type(&self) -> TurnType {
        match self {
            WorkflowRequest::Initialize(_) => TurnType::Initialize,
            WorkflowRequest::Extend(_) => TurnType::Extend,
            WorkflowRequest::Recompute(_) => TurnType::Recompute,
        }
    }

    /// 既存セッションを対象とする場合、そのセッションID
    pub fn session_id(&self) -> Option<&str> {
        match self {
            WorkflowRequest::Initialize(_) => None,
            WorkflowRequest::Extend(req) => Some(&req.session_id),
            WorkflowRequest::Recompute(req) => Some(&req.session_id),
        }
    }

    /// ネットワーク呼び出しの前に行う入力検証
    ///
    /// # エラー
    ///
    /// 不正な理由を表す文字列を返します。
    pub fn validate(&self) -> Result<(), String> {
        match self {
            WorkflowRequest::Initialize(req) => validate_turn_input(
                &req.user_message,
                &req.provider_ids,
                [&req.mapping_provider, &req.synthesis_provider],
            ),
            WorkflowRequest::Extend(req) => {
                if req.session_id.trim().is_empty() {
                    return Err("session_id が空です".to_string());
                }
                validate_turn_input(
                    &req.user_message,
                    &req.provider_ids,
                    [&req.mapping_provider, &req.synthesis_provider],
                )
            }
            WorkflowRequest::Recompute(req) => {
                if req.session_id.trim().is_empty() {
                    return Err("session_id が空です".to_string());
                }
                if req.source_turn_id.trim().is_empty() {
                    return Err("source_turn_id が空です".to_string());
                }
                if req.target_provider.trim().is_empty() {
                    return Err("target_provider が空です".to_string());
                }
                if req.step_type == StepType::Prompt {
                    return Err("Recompute できるのは mapping / synthesis ステップのみです".to_string());
                }
                Ok(())
            }
        }
    }
}

fn validate_turn_input(
    user_message: &str,
    provider_ids: &[String],
    single_providers: [&Option<String>; 2],
) -> Result<(), String> {
    if user_message.trim().is_empty() {
        return Err("user_message が空です".to_string());
    }
    if provider_ids.is_empty() {
        return Err("provider_ids が空です".to_string());
    }
    for (i, id) in provider_ids.iter().enumerate() {
        if id.trim().is_empty() {
            return Err("空のプロバイダーIDが含まれています".to_string());
        }
        if provider_ids[..i].contains(id) {
            return Err(format!("プロバイダーID '{}' が重複しています", id));
        }
    }
    for provider in single_providers.into_iter().flatten() {
        if provider.trim().is_empty() {
            return Err("mapping / synthesis のプロバイダーIDが空です".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialize(providers: &[&str]) -> WorkflowRequest {
        WorkflowRequest::Initialize(InitializeRequest {
            user_message: "hello".to_string(),
            provider_ids: providers.iter().map(|p| p.to_string()).collect(),
            mapping_provider: None,
            synthesis_provider: Some("a".to_string()),
        })
    }

    #[test]
    fn test_validate_accepts_initialize() {
        assert!(initialize(&["a", "b"]).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_provider_list() {
        let err = initialize(&[]).validate().unwrap_err();
        assert!(err.contains("provider_ids"));
    }

    #[test]
    fn test_validate_rejects_duplicate_providers() {
        assert!(initialize(&["a", "a"]).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_prompt_recompute() {
        let req = WorkflowRequest::Recompute(RecomputeRequest {
            session_id: "s".to_string(),
            source_turn_id: "t".to_string(),
            step_type: StepType::Prompt,
            target_provider: "a".to_string(),
        });
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_turn_type_and_session_id() {
        let req = WorkflowRequest::Extend(ExtendRequest {
            session_id: "s1".to_string(),
            user_message: "next".to_string(),
            provider_ids: vec!["a".to_string()],
            mapping_provider: None,
            synthesis_provider: None,
        });
        assert_eq!(req.turn_type(), TurnType::Extend);
        assert_eq!(req.session_id(), Some("s1"));
        assert_eq!(initialize(&["a"]).session_id(), None);
    }

    #[test]
    fn test_step_type_response_type() {
        assert_eq!(StepType::Prompt.response_type(), ResponseType::Batch);
        assert_eq!(StepType::Synthesis.response_type(), ResponseType::Synthesis);
    }
}
