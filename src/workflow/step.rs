//! コンパイル済みステップ
//!
//! ステップは種別ごとのペイロードを持つ直和型です。実行時は
//! [`StepPayload`] を網羅的に `match` して処理を振り分けます。

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::model::{ProviderContexts, StepType};

/// プロバイダーID → 出力テキスト
pub type StepOutputs = BTreeMap<String, String>;

/// ステップの入力
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum StepInput {
    /// 同じワークフロー内の先行ステップの出力
    FromStep(String),
    /// 過去ターンから凍結された出力（Recompute）
    Frozen(StepOutputs),
}

impl StepInput {
    /// 依存する先行ステップ
    pub fn upstream(&self) -> Option<&str> {
        match self {
            StepInput::FromStep(step_id) => Some(step_id),
            StepInput::Frozen(_) => None,
        }
    }
}

/// 種別ごとのペイロード
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepPayload {
    /// 複数プロバイダーへのファンアウト
    Prompt {
        prompt: String,
        provider_ids: Vec<String>,
        /// 継続呼び出しに使うコンテキスト（要求されたプロバイダー分のみ）
        provider_contexts: ProviderContexts,
    },
    /// バッチ出力を1プロバイダーで整理する
    Mapping {
        provider_id: String,
        original_prompt: String,
        input: StepInput,
        provider_context: Option<Value>,
    },
    /// バッチ出力を1プロバイダーで統合する
    Synthesis {
        provider_id: String,
        original_prompt: String,
        input: StepInput,
        /// マッピング出力（任意。失敗していても統合は実行する）
        mapping: Option<StepInput>,
        provider_context: Option<Value>,
    },
}

/// コンパイル済みの実行単位
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub step_id: String,
    #[serde(flatten)]
    pub payload: StepPayload,
}

impl Step {
    /// `{種別}-{位置}` 形式のIDでステップを作る
    pub fn new(index: usize, payload: StepPayload) -> Self {
        let step_type = payload_type(&payload);
        Self {
            step_id: format!("{}-{}", step_type, index),
            payload,
        }
    }

    pub fn step_type(&self) -> StepType {
        payload_type(&self.payload)
    }

    /// 成功していなければこのステップを実行できない先行ステップ
    pub fn required_upstream(&self) -> Option<&str> {
        match &self.payload {
            StepPayload::Prompt { .. } => None,
            StepPayload::Mapping { input, .. } | StepPayload::Synthesis { input, .. } => input.upstream(),
        }
    }
}

fn payload_type(payload: &StepPayload) -> StepType {
    match payload {
        StepPayload::Prompt { .. } => StepType::Prompt,
        StepPayload::Mapping { .. } => StepType::Mapping,
        StepPayload::Synthesis { .. } => StepType::Synthesis,
    }
}

fn push_outputs(prompt: &mut String, outputs: &StepOutputs) {
    for (provider_id, text) in outputs {
        prompt.push_str(&format!("\n<response provider=\"{}\">\n{}\n</response>\n", provider_id, text.trim()));
    }
}

/// マッピングステップのプロンプトを組み立てる
pub fn compose_mapping_prompt(original_prompt: &str, outputs: &StepOutputs) -> String {
    let mut prompt = format!(
        "次の質問に対する複数のAIの回答を比較し、共通点・相違点・固有の指摘を整理してください。\n\n<question>\n{}\n</question>\n",
        original_prompt.trim()
    );
    push_outputs(&mut prompt, outputs);
    prompt
}

/// 統合ステップのプロンプトを組み立てる
pub fn compose_synthesis_prompt(original_prompt: &str, outputs: &StepOutputs, mapping: Option<&str>) -> String {
    let mut prompt = format!(
        "次の質問に対する複数のAIの回答を踏まえ、最良の回答を1つにまとめてください。\n\n<question>\n{}\n</question>\n",
        original_prompt.trim()
    );
    push_outputs(&mut prompt, outputs);
    if let Some(mapping) = mapping {
        prompt.push_str(&format!("\n<analysis>\n{}\n</analysis>\n", mapping.trim()));
    }
    prompt
}
