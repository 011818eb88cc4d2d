//! Companion facial expression derived from response text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    #[default]
    Neutral,
    Happy,
    Sad,
    Thinking,
    Surprised,
}

const HAPPY_KEYWORDS: &[&str] = &[
    "哈哈", "嘻嘻", "开心", "高兴", "快乐", "太好了", "喜欢", "棒", "😊", "😄", "haha", "happy",
    "glad", "great", "love",
];

const SAD_KEYWORDS: &[&str] = &[
    "难过", "伤心", "遗憾", "抱歉", "对不起", "可惜", "哭", "😢", "sad", "sorry", "unfortunately",
];

const SURPRISED_KEYWORDS: &[&str] = &[
    "哇", "天哪", "真的吗", "居然", "竟然", "没想到", "😮", "wow", "really?", "amazing",
];

impl Expression {
    /// Keyword classification of a response. Happy wins over sad, sad over surprised.
    pub fn from_response(text: &str) -> Self {
        let lowered = text.to_lowercase();
        let hit = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));
        if hit(HAPPY_KEYWORDS) {
            Expression::Happy
        } else if hit(SAD_KEYWORDS) {
            Expression::Sad
        } else if hit(SURPRISED_KEYWORDS) {
            Expression::Surprised
        } else {
            Expression::Neutral
        }
    }
}
