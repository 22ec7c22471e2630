//! 重み付き全体進捗
//!
//! 各ステージは固定の重みを持ち、合計は 100。
//! 完了ステージは重み全体、実行中ステージは `重み × 進捗 / 100` を寄与し、
//! それ以外は 0。合計は切り捨てて 0..=100 に収める。

use std::collections::BTreeMap;

use crate::domain::job::{StageName, StageState, StageStatus};

/// 実行中ステージの寄与上限（%）。全ステージ完了時にのみ 100 に到達させる。
const IN_PROGRESS_CAP: u32 = 99;

impl StageName {
    /// 全体進捗に対する重み
    pub fn weight(&self) -> u32 {
        match self {
            StageName::Vad => 5,
            StageName::Enhancement => 5,
            StageName::Transcription => 40,
            StageName::Diarization => 30,
            StageName::Extraction => 15,
            StageName::Calendar => 5,
        }
    }
}

/// ステージマップから全体進捗を計算する。
pub fn overall_progress(stages: &BTreeMap<StageName, StageState>) -> u8 {
    // 百分率の 100 倍で積算して整数演算で切り捨てる
    let scaled: u32 = stages
        .iter()
        .map(|(name, state)| match state.status {
            StageStatus::Complete => name.weight() * 100,
            StageStatus::InProgress => {
                name.weight() * u32::from(state.progress).min(IN_PROGRESS_CAP)
            }
            StageStatus::Pending | StageStatus::Failed => 0,
        })
        .sum();
    (scaled / 100).min(100) as u8
}
